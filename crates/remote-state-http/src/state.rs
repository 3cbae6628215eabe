use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use remote_state_core::{checksum, Payload, StateError, StateStore};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Response, StatusCode, Url};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

const CONTENT_MD5_HEADER: &str = "Content-MD5";

/// Where and how to reach the state endpoint.
#[derive(Debug, Clone, Default)]
pub struct HttpStateConfig {
    /// `http` or `https` URL of the state resource.
    pub address: String,
    /// Accept any TLS certificate. Off unless explicitly requested.
    pub skip_cert_verification: bool,
}

/// Remote state behind a plain HTTP resource: `GET` reads, `POST` writes,
/// `DELETE` removes.
///
/// This backend cannot lock.
pub struct HttpState {
    http_client: HttpClient,
    url: Url,
    guard: Mutex<()>,
}

impl HttpState {
    pub fn from_config(config: &HttpStateConfig) -> Result<Self, StateError> {
        let http_client = HttpClient::builder()
            .danger_accept_invalid_certs(config.skip_cert_verification)
            .build()
            .map_err(|e| StateError::InvalidArgument(format!("Failed to build HTTP client: {}", e)))?;
        Self::with_client(http_client, &config.address)
    }

    /// Use a preconfigured client (timeouts, proxies, auth headers).
    pub fn with_client(http_client: HttpClient, address: &str) -> Result<Self, StateError> {
        let url = Url::parse(address).map_err(|e| {
            StateError::InvalidArgument(format!("Invalid HTTP state address {:?}: {}", address, e))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(StateError::InvalidArgument(format!(
                "HTTP state address must use http or https, got {:?}",
                url.scheme()
            )));
        }

        Ok(Self {
            http_client,
            url,
            guard: Mutex::new(()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn transport_error(&self, what: &str, e: reqwest::Error) -> StateError {
        StateError::Transport(format!("HTTP {} {} failed: {}", what, self.url, e))
    }

    fn status_error(&self, what: &str, status: StatusCode) -> StateError {
        let msg = match status {
            StatusCode::UNAUTHORIZED => "HTTP remote state endpoint requires auth".to_string(),
            StatusCode::FORBIDDEN => "HTTP remote state endpoint invalid auth".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR => "HTTP remote state internal server error".to_string(),
            other => format!("unexpected HTTP response code {}", other.as_u16()),
        };
        StateError::Transport(format!("{} on {} {}", msg, what, self.url))
    }

    /// Digest announced by the server, if any.
    fn content_md5(response: &Response) -> Result<Option<Vec<u8>>, StateError> {
        let Some(raw) = response.headers().get(CONTENT_MD5_HEADER) else {
            return Ok(None);
        };
        let raw = raw.to_str().map_err(|e| {
            StateError::Serialization(format!("Invalid Content-MD5 header: {}", e))
        })?;
        BASE64
            .decode(raw.trim())
            .map(Some)
            .map_err(|e| StateError::Serialization(format!("Failed to decode Content-MD5 {:?}: {}", raw, e)))
    }
}

#[async_trait]
impl StateStore for HttpState {
    fn backend_name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self), level = "debug", fields(url = %self.url))]
    async fn get(&self) -> Result<Option<Payload>, StateError> {
        let _guard = self.guard.lock().await;

        let response = self
            .http_client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error("GET", e))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                debug!("No state at {}", self.url);
                return Ok(None);
            }
            other => return Err(self.status_error("GET", other)),
        }

        let announced = Self::content_md5(&response)?;
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error("GET body of", e))?
            .to_vec();
        if body.is_empty() {
            return Ok(None);
        }

        // the announced digest covers the body as sent, before any gunzip
        let body = match announced {
            Some(expected) => Payload::with_checksum(body, &expected)?.data,
            None => body,
        };

        let payload = Payload::from_stored(body)?;
        debug!("Loaded state from {} ({} bytes)", self.url, payload.data.len());
        Ok(Some(payload))
    }

    #[instrument(skip(self, data), level = "debug", fields(url = %self.url, data_len = data.len()))]
    async fn put(&self, data: &[u8]) -> Result<(), StateError> {
        let _guard = self.guard.lock().await;

        let md5 = BASE64.encode(checksum(data));
        let response = self
            .http_client
            .post(self.url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
            .header(CONTENT_MD5_HEADER, md5)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| self.transport_error("POST", e))?;

        let status = response.status();
        if status.is_success() {
            debug!("Saved state to {} ({} bytes)", self.url, data.len());
            return Ok(());
        }
        match status {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                let text = response.text().await.unwrap_or_default();
                Err(StateError::Conflict(format!(
                    "HTTP POST {} rejected with status {}: {}",
                    self.url,
                    status,
                    text.trim()
                )))
            }
            other => Err(self.status_error("POST", other)),
        }
    }

    #[instrument(skip(self), level = "debug", fields(url = %self.url))]
    async fn delete(&self) -> Result<(), StateError> {
        let _guard = self.guard.lock().await;

        let response = self
            .http_client
            .delete(self.url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error("DELETE", e))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!("Deleted state at {}", self.url);
            return Ok(());
        }
        Err(self.status_error("DELETE", status))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use remote_state_core::{compress, conformance};
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Keeps one state document in memory, like a minimal HTTP backend.
    #[derive(Clone, Default)]
    struct StateServer {
        state: Arc<StdMutex<Option<Vec<u8>>>>,
    }

    impl Respond for StateServer {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let mut state = self.state.lock().unwrap();
            match request.method.as_str() {
                "GET" => match state.as_ref() {
                    Some(data) => ResponseTemplate::new(200)
                        .insert_header(CONTENT_MD5_HEADER, BASE64.encode(checksum(data)).as_str())
                        .set_body_bytes(data.clone()),
                    None => ResponseTemplate::new(404),
                },
                "POST" => {
                    *state = Some(request.body.clone());
                    ResponseTemplate::new(200)
                }
                "DELETE" => {
                    *state = None;
                    ResponseTemplate::new(200)
                }
                _ => ResponseTemplate::new(405),
            }
        }
    }

    async fn setup() -> (MockServer, HttpState) {
        let server = MockServer::start().await;
        let store = HttpState::from_config(&HttpStateConfig {
            address: format!("{}/state/prod", server.uri()),
            skip_cert_verification: false,
        })
        .unwrap();
        (server, store)
    }

    #[tokio::test]
    async fn test_conformance_client() {
        let (server, store) = setup().await;
        Mock::given(path("/state/prod"))
            .respond_with(StateServer::default())
            .mount(&server)
            .await;

        conformance::test_client(&store).await;
    }

    #[tokio::test]
    async fn test_missing_and_empty_state() {
        let (server, store) = setup().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        assert!(store.get().await.unwrap().is_none());

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(store.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let (server, store) = setup().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(CONTENT_MD5_HEADER, BASE64.encode(checksum(b"other")).as_str())
                    .set_body_bytes(b"{\"serial\":1}".to_vec()),
            )
            .mount(&server)
            .await;

        let err = store.get().await.unwrap_err();
        assert!(matches!(err, StateError::Checksum { .. }));
    }

    #[tokio::test]
    async fn test_checksum_computed_without_header() {
        let (server, store) = setup().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{}".to_vec()))
            .mount(&server)
            .await;

        let payload = store.get().await.unwrap().unwrap();
        assert_eq!(payload.md5, checksum(b"{}"));
    }

    #[tokio::test]
    async fn test_gzip_body_digest_of_plain_data() {
        let (server, store) = setup().await;
        let data = conformance::sample_state();
        let body = compress(&data).unwrap();
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(CONTENT_MD5_HEADER, BASE64.encode(checksum(&body)).as_str())
                    .set_body_bytes(body),
            )
            .mount(&server)
            .await;

        let payload = store.get().await.unwrap().unwrap();
        assert_eq!(payload.data, data);
        assert_eq!(payload.md5, checksum(&data));
    }

    #[tokio::test]
    async fn test_post_sends_headers() {
        let (server, store) = setup().await;
        Mock::given(method("POST"))
            .and(path("/state/prod"))
            .and(header("content-type", "application/octet-stream"))
            .and(header(CONTENT_MD5_HEADER, BASE64.encode(checksum(b"abc")).as_str()))
            .and(body_bytes(b"abc".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        store.put(b"abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_post_conflict() {
        let (server, store) = setup().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("serial is stale"))
            .mount(&server)
            .await;

        assert!(store.put(b"abc").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_status_errors() {
        let (server, store) = setup().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let err = store.get().await.unwrap_err();
        assert!(err.to_string().contains("requires auth"));

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let err = store.get().await.unwrap_err();
        assert!(err.to_string().contains("invalid auth"));

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(418))
            .mount(&server)
            .await;
        let err = store.get().await.unwrap_err();
        assert!(err.to_string().contains("unexpected HTTP response code 418"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (server, store) = setup().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        store.delete().await.unwrap();
    }

    #[test]
    fn test_cert_verification_on_by_default() {
        let config = HttpStateConfig {
            address: "https://state.example.com/prod".to_string(),
            ..Default::default()
        };
        assert!(!config.skip_cert_verification);
        assert!(HttpState::from_config(&config).is_ok());
    }

    #[test]
    fn test_address_must_be_http() {
        let config = HttpStateConfig {
            address: "ftp://example.com/state".to_string(),
            skip_cert_verification: false,
        };
        assert!(matches!(
            HttpState::from_config(&config),
            Err(StateError::InvalidArgument(_))
        ));

        let config = HttpStateConfig {
            address: "not a url".to_string(),
            skip_cert_verification: true,
        };
        assert!(HttpState::from_config(&config).is_err());
    }
}
