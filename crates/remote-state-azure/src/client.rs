use async_trait::async_trait;
use remote_state_core::StateError;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};

use crate::transport::{BlobProperties, BlobTransport, LeaseOutcome, Metadata};

const API_VERSION: &str = "2021-08-06";
const VERSION_HEADER: &str = "x-ms-version";
const LEASE_ID_HEADER: &str = "x-ms-lease-id";
const LEASE_ACTION_HEADER: &str = "x-ms-lease-action";
const LEASE_DURATION_HEADER: &str = "x-ms-lease-duration";
const PROPOSED_LEASE_ID_HEADER: &str = "x-ms-proposed-lease-id";
const LEASE_STATUS_HEADER: &str = "x-ms-lease-status";
const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";
const DELETE_SNAPSHOTS_HEADER: &str = "x-ms-delete-snapshots";
const META_PREFIX: &str = "x-ms-meta-";

/// Client for the Azure Blob Storage REST API.
///
/// Requests are authorized with an already-issued SAS token appended to
/// every URL.
#[derive(Clone)]
pub struct AzureBlobClient {
    http_client: HttpClient,
    endpoint: String,
    sas_token: String,
}

impl AzureBlobClient {
    /// Create a client for the storage account at `endpoint`, e.g.
    /// `https://myaccount.blob.core.windows.net`.
    pub fn new(
        http_client: HttpClient,
        endpoint: impl Into<String>,
        sas_token: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            sas_token: sas_token.into().trim_start_matches('?').to_string(),
        }
    }

    fn blob_url(&self, name: &str) -> String {
        let encoded: Vec<String> = name
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        let mut url = format!("{}/{}", self.endpoint, encoded.join("/"));
        if !self.sas_token.is_empty() {
            url.push('?');
            url.push_str(&self.sas_token);
        }
        url
    }

    fn request(&self, method: Method, name: &str, lease: Option<&str>) -> RequestBuilder {
        let mut request = self
            .http_client
            .request(method, self.blob_url(name))
            .header(VERSION_HEADER, API_VERSION);
        if let Some(lease) = lease {
            request = request.header(LEASE_ID_HEADER, lease);
        }
        request
    }

    fn with_metadata(mut request: RequestBuilder, metadata: &Metadata) -> RequestBuilder {
        for (key, value) in metadata {
            request = request.header(format!("{}{}", META_PREFIX, key), value);
        }
        request
    }

    async fn send(request: RequestBuilder, what: &str, name: &str) -> Result<Response, StateError> {
        request.send().await.map_err(|e| {
            StateError::Transport(format!("Azure {} request for {} failed: {}", what, name, e))
        })
    }

    /// Map a non-success response; lease and precondition failures are
    /// conflicts.
    async fn check_status(response: Response, what: &str, name: &str) -> Result<Response, StateError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let msg = format!(
            "Azure {} for {} failed with status {}: {}",
            what,
            name,
            status,
            text.trim()
        );
        match status {
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => Err(StateError::Conflict(msg)),
            _ => Err(StateError::Transport(msg)),
        }
    }

    fn parse_properties(response: &Response) -> BlobProperties {
        let headers = response.headers();
        let metadata = headers
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(META_PREFIX)?;
                let value = value.to_str().ok()?;
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        let leased = headers
            .get(LEASE_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("locked"));

        BlobProperties { metadata, leased }
    }
}

#[async_trait]
impl BlobTransport for AzureBlobClient {
    #[instrument(skip(self), level = "debug")]
    async fn get_blob(&self, name: &str, lease: Option<&str>) -> Result<Option<Vec<u8>>, StateError> {
        let response = Self::send(self.request(Method::GET, name, lease), "GET", name).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Blob not found: {}", name);
            return Ok(None);
        }

        let response = Self::check_status(response, "GET", name).await?;
        let bytes = response.bytes().await.map_err(|e| {
            StateError::Transport(format!("Failed to read blob {}: {}", name, e))
        })?;
        Ok(Some(bytes.to_vec()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_properties(
        &self,
        name: &str,
        lease: Option<&str>,
    ) -> Result<Option<BlobProperties>, StateError> {
        let response = Self::send(self.request(Method::HEAD, name, lease), "HEAD", name).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::check_status(response, "HEAD", name).await?;
        Ok(Some(Self::parse_properties(&response)))
    }

    #[instrument(skip(self, data, metadata), level = "debug", fields(data_len = data.len()))]
    async fn put_blob(
        &self,
        name: &str,
        data: &[u8],
        metadata: &Metadata,
        lease: Option<&str>,
    ) -> Result<(), StateError> {
        let request = self
            .request(Method::PUT, name, lease)
            .header(BLOB_TYPE_HEADER, "BlockBlob")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data.to_vec());
        let request = Self::with_metadata(request, metadata);

        let response = Self::send(request, "PUT", name).await?;
        Self::check_status(response, "PUT", name).await?;
        debug!("Wrote blob {} ({} bytes)", name, data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn snapshot_blob(&self, name: &str, lease: Option<&str>) -> Result<(), StateError> {
        let request = self
            .request(Method::PUT, name, lease)
            .query(&[("comp", "snapshot")]);

        let response = Self::send(request, "snapshot", name).await?;
        Self::check_status(response, "snapshot", name).await?;
        debug!("Snapshotted blob {}", name);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_blob(&self, name: &str, lease: Option<&str>) -> Result<(), StateError> {
        // a blob with snapshots cannot be deleted on its own
        let request = self
            .request(Method::DELETE, name, lease)
            .header(DELETE_SNAPSHOTS_HEADER, "include");
        let response = Self::send(request, "DELETE", name).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(response, "DELETE", name).await?;
        Ok(())
    }

    #[instrument(skip(self, metadata), level = "debug")]
    async fn set_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
        lease: Option<&str>,
    ) -> Result<(), StateError> {
        let request = self
            .request(Method::PUT, name, lease)
            .query(&[("comp", "metadata")]);
        let request = Self::with_metadata(request, metadata);

        let response = Self::send(request, "set metadata", name).await?;
        Self::check_status(response, "set metadata", name).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire_lease(&self, name: &str, proposed_id: &str) -> Result<LeaseOutcome, StateError> {
        let request = self
            .request(Method::PUT, name, None)
            .query(&[("comp", "lease")])
            .header(LEASE_ACTION_HEADER, "acquire")
            .header(LEASE_DURATION_HEADER, "-1")
            .header(PROPOSED_LEASE_ID_HEADER, proposed_id);

        let response = Self::send(request, "lease acquire", name).await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Blob {} is already leased", name);
            return Ok(LeaseOutcome::AlreadyLeased);
        }

        let response = Self::check_status(response, "lease acquire", name).await?;
        let lease_id = response
            .headers()
            .get(LEASE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(proposed_id)
            .to_string();
        Ok(LeaseOutcome::Acquired(lease_id))
    }

    #[instrument(skip(self), level = "debug")]
    async fn release_lease(&self, name: &str, lease_id: &str) -> Result<(), StateError> {
        let request = self
            .request(Method::PUT, name, Some(lease_id))
            .query(&[("comp", "lease")])
            .header(LEASE_ACTION_HEADER, "release");

        let response = Self::send(request, "lease release", name).await?;
        Self::check_status(response, "lease release", name).await?;
        Ok(())
    }
}
