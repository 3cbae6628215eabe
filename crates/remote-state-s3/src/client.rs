use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use remote_state_core::StateError;
use tracing::{debug, instrument};

use crate::transport::{ObjectTransport, PutCondition, PutOutcome, StoredObject};

/// [`ObjectTransport`] over one S3 bucket.
///
/// Conditional writes need a store that honours `If-None-Match: *` and
/// `If-Match` on `PutObject` (AWS S3 and most S3-compatible stores).
#[derive(Clone)]
pub struct S3Objects {
    s3_client: S3Client,
    bucket_name: String,
}

impl S3Objects {
    pub fn new(s3_client: S3Client, bucket_name: impl Into<String>) -> Self {
        Self {
            s3_client,
            bucket_name: bucket_name.into(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }
}

#[async_trait]
impl ObjectTransport for S3Objects {
    #[instrument(skip(self), level = "debug")]
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>, StateError> {
        let result = self
            .s3_client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::Transport(format!("Failed to read S3 object body: {}", e)))?
                    .into_bytes();
                Ok(Some(StoredObject {
                    body: bytes.to_vec(),
                    etag,
                }))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    debug!("S3 object not found: {}", key);
                    Ok(None)
                } else {
                    Err(StateError::Transport(format!(
                        "S3 get_object error for {}: {}",
                        key, service_error
                    )))
                }
            }
        }
    }

    #[instrument(skip(self, body), level = "debug", fields(body_len = body.len()))]
    async fn put_object(
        &self,
        key: &str,
        body: &[u8],
        condition: PutCondition,
    ) -> Result<PutOutcome, StateError> {
        let mut request = self
            .s3_client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(ByteStream::from(body.to_vec()));

        request = match condition {
            PutCondition::None => request,
            PutCondition::IfAbsent => request.if_none_match("*"),
            PutCondition::IfMatch(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(output) => Ok(PutOutcome::Written {
                etag: output.e_tag().map(str::to_string),
            }),
            Err(e) => {
                // 412 when the precondition fails, 409 when a concurrent
                // conditional write raced this one
                let status = e.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(412) | Some(409)) {
                    debug!("S3 conditional put on {} rejected ({:?})", key, status);
                    return Ok(PutOutcome::PreconditionFailed);
                }
                Err(StateError::Transport(format!(
                    "S3 put_object error for {}: {}",
                    key,
                    e.into_service_error()
                )))
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_object(&self, key: &str) -> Result<(), StateError> {
        self.s3_client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StateError::Transport(format!(
                    "S3 delete_object error for {}: {}",
                    key,
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }
}
