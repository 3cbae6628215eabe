use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use remote_state_core::StateError;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::transport::{KvPair, KvTransport, KvVerb, SessionLock, TxnOutcome};

/// Default TTL of lock sessions. The session is renewed at half this.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15);

const TOKEN_HEADER: &str = "X-Consul-Token";
const INDEX_HEADER: &str = "X-Consul-Index";

/// Consul HTTP API client.
///
/// Uses the KV, transaction and session endpoints of the v1 API. The
/// `reqwest::Client` is supplied by the caller, so timeouts and TLS are
/// configured there.
#[derive(Clone)]
pub struct ConsulClient {
    http_client: HttpClient,
    address: String,
    token: Option<String>,
    datacenter: Option<String>,
    session_ttl: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
    modify_index: u64,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Serialize)]
struct TxnOp<'a> {
    #[serde(rename = "KV")]
    kv: TxnKvOp<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TxnKvOp<'a> {
    verb: &'static str,
    key: &'a str,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxnResponse {
    #[serde(default)]
    results: Option<Vec<TxnResult>>,
    #[serde(default)]
    errors: Option<Vec<TxnError>>,
}

#[derive(Debug, Deserialize)]
struct TxnResult {
    #[serde(rename = "KV")]
    kv: TxnKvResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxnKvResult {
    modify_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxnError {
    #[serde(default)]
    op_index: usize,
    #[serde(default)]
    what: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest {
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'static str,
    lock_delay: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

impl ConsulClient {
    /// Create a client for the agent at `address` (`host:port` or a URL).
    pub fn new(http_client: HttpClient, address: impl Into<String>) -> Self {
        let address = address.into();
        let address = if address.starts_with("http://") || address.starts_with("https://") {
            address
        } else {
            format!("http://{}", address)
        };

        Self {
            http_client,
            address: address.trim_end_matches('/').to_string(),
            token: None,
            datacenter: None,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// ACL token sent with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    fn kv_url(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/v1/kv/{}", self.address, encoded.join("/"))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut request = self.http_client.request(method, url);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        request
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, StateError> {
        request
            .send()
            .await
            .map_err(|e| StateError::Transport(format!("Consul {} request failed: {}", what, e)))
    }

    async fn check_status(response: Response, what: &str) -> Result<Response, StateError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(StateError::Transport(format!(
            "Consul {} failed with status {}: {}",
            what,
            status,
            text.trim()
        )))
    }

    async fn read_bool(response: Response, what: &str) -> Result<bool, StateError> {
        let text = response
            .text()
            .await
            .map_err(|e| StateError::Transport(format!("Failed to read Consul {} response: {}", what, e)))?;
        Ok(text.trim() == "true")
    }

    async fn get_entry(&self, key: &str) -> Result<(Option<KvEntry>, u64), StateError> {
        let url = self.kv_url(key);
        let response = self.send(self.request(Method::GET, &url), "KV GET").await?;
        Self::parse_entry(response, key).await
    }

    async fn parse_entry(response: Response, key: &str) -> Result<(Option<KvEntry>, u64), StateError> {
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Consul key not found: {}", key);
            return Ok((None, index));
        }

        let response = Self::check_status(response, "KV GET").await?;
        let entries: Vec<KvEntry> = response.json().await.map_err(|e| {
            StateError::Serialization(format!("Failed to parse Consul KV response: {}", e))
        })?;
        Ok((entries.into_iter().next(), index))
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_session(&self) -> Result<String, StateError> {
        let url = format!("{}/v1/session/create", self.address);
        let body = SessionRequest {
            name: "remote-state lock".to_string(),
            ttl: format!("{}s", self.session_ttl.as_secs().max(10)),
            behavior: "release",
            lock_delay: "15s".to_string(),
        };
        let response = self
            .send(self.request(Method::PUT, &url).json(&body), "session create")
            .await?;
        let response = Self::check_status(response, "session create").await?;
        let session: SessionResponse = response.json().await.map_err(|e| {
            StateError::Serialization(format!("Failed to parse Consul session response: {}", e))
        })?;
        debug!("Created Consul session {}", session.id);
        Ok(session.id)
    }

    /// Renew a session. `Ok(false)` means the session no longer exists.
    async fn renew_session(&self, session: &str) -> Result<bool, StateError> {
        let url = format!("{}/v1/session/renew/{}", self.address, session);
        let response = self.send(self.request(Method::PUT, &url), "session renew").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check_status(response, "session renew").await?;
        Ok(true)
    }

    async fn destroy_session(&self, session: &str) -> Result<(), StateError> {
        let url = format!("{}/v1/session/destroy/{}", self.address, session);
        let response = self
            .send(self.request(Method::PUT, &url), "session destroy")
            .await?;
        Self::check_status(response, "session destroy").await?;
        Ok(())
    }

    async fn try_acquire(&self, key: &str, session: &str) -> Result<bool, StateError> {
        let url = self.kv_url(key);
        let response = self
            .send(
                self.request(Method::PUT, &url).query(&[("acquire", session)]),
                "lock acquire",
            )
            .await?;
        let response = Self::check_status(response, "lock acquire").await?;
        Self::read_bool(response, "lock acquire").await
    }

    /// Wait at most `wait` for the lock key to change.
    async fn wait_for_release(&self, key: &str, wait: Duration) -> Result<(), StateError> {
        let (entry, index) = self.get_entry(key).await?;
        let held = entry.and_then(|e| e.session).is_some_and(|s| !s.is_empty());
        if !held || index == 0 {
            return Ok(());
        }

        let url = self.kv_url(key);
        let request = self.request(Method::GET, &url).query(&[
            ("index", index.to_string()),
            ("wait", format!("{}ms", wait.as_millis())),
        ]);
        // the server adds jitter to the wait, so bound it locally as well
        match tokio::time::timeout(wait + Duration::from_millis(250), self.send(request, "KV watch")).await {
            Ok(response) => {
                response?;
            }
            Err(_) => debug!("Lock {} still held after {:?}", key, wait),
        }
        Ok(())
    }

    fn hold(&self, key: &str, session: String) -> SessionLock {
        let (lost_tx, lost_rx) = oneshot::channel();
        let monitor = tokio::spawn(self.clone().monitor_session(
            key.to_string(),
            session.clone(),
            lost_tx,
        ));
        SessionLock::new(key, session, lost_rx).with_monitor(monitor)
    }

    /// Keep the session alive and report when the lock is gone.
    async fn monitor_session(self, key: String, session: String, lost: oneshot::Sender<()>) {
        let interval = self.session_ttl / 2;
        let mut last_renewed = Instant::now();

        loop {
            tokio::time::sleep(interval).await;
            if lost.is_closed() {
                return;
            }

            match self.renew_session(&session).await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!("Consul session {} for {} was invalidated", session, key);
                    break;
                }
                Err(e) => {
                    if last_renewed.elapsed() >= self.session_ttl {
                        warn!("Consul session {} for {} expired: {}", session, key, e);
                        break;
                    }
                    debug!("Renewing Consul session {} failed: {}", session, e);
                    continue;
                }
            }

            match self.get_entry(&key).await {
                Ok((Some(entry), _)) if entry.session.as_deref() == Some(session.as_str()) => {}
                Ok(_) => {
                    warn!("Consul lock {} is no longer held by session {}", key, session);
                    break;
                }
                Err(e) => debug!("Checking Consul lock {} failed: {}", key, e),
            }
        }

        let _ = lost.send(());
    }
}

#[async_trait]
impl KvTransport for ConsulClient {
    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StateError> {
        let (entry, _) = self.get_entry(key).await?;
        let Some(entry) = entry else {
            return Ok(None);
        };

        let value = match entry.value {
            Some(encoded) => BASE64.decode(encoded.as_bytes()).map_err(|e| {
                StateError::Serialization(format!("Failed to decode Consul value: {}", e))
            })?,
            None => Vec::new(),
        };

        debug!("Consul GET {} ({} bytes)", entry.key, value.len());
        Ok(Some(KvPair {
            key: entry.key,
            value,
            modify_index: entry.modify_index,
        }))
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StateError> {
        let url = self.kv_url(key);
        let response = self
            .send(self.request(Method::PUT, &url).body(value.to_vec()), "KV PUT")
            .await?;
        let response = Self::check_status(response, "KV PUT").await?;
        if !Self::read_bool(response, "KV PUT").await? {
            return Err(StateError::Transport(format!("Consul refused write to {}", key)));
        }
        debug!("Consul PUT {} ({} bytes)", key, value.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<(), StateError> {
        let url = self.kv_url(key);
        let response = self.send(self.request(Method::DELETE, &url), "KV DELETE").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(response, "KV DELETE").await?;
        debug!("Consul DELETE {}", key);
        Ok(())
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn txn_put(
        &self,
        key: &str,
        value: &[u8],
        verb: KvVerb,
    ) -> Result<TxnOutcome, StateError> {
        let (verb_name, index) = match verb {
            KvVerb::Set => ("set", None),
            KvVerb::Cas(index) => ("cas", Some(index)),
        };
        let ops = [TxnOp {
            kv: TxnKvOp {
                verb: verb_name,
                key,
                value: BASE64.encode(value),
                index,
            },
        }];

        let url = format!("{}/v1/txn", self.address);
        let response = self
            .send(self.request(Method::PUT, &url).json(&ops), "transaction")
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let body: TxnResponse = response.json().await.unwrap_or_default();
            let errors = body
                .errors
                .unwrap_or_default()
                .into_iter()
                .map(|e| format!("op {}: {}", e.op_index, e.what))
                .collect();
            return Ok(TxnOutcome::RolledBack { errors });
        }

        let response = Self::check_status(response, "transaction").await?;
        let body: TxnResponse = response.json().await.map_err(|e| {
            StateError::Serialization(format!("Failed to parse Consul transaction response: {}", e))
        })?;

        let results = body.results.unwrap_or_default();
        if results.len() != 1 {
            return Err(StateError::Transport(format!(
                "expected 1 transaction result, got {}",
                results.len()
            )));
        }

        let modify_index = results[0].kv.modify_index;
        debug!("Consul {} {} committed at index {}", verb_name, key, modify_index);
        Ok(TxnOutcome::Committed { modify_index })
    }

    #[instrument(skip(self), level = "debug")]
    async fn lock(&self, key: &str, wait: Duration) -> Result<Option<SessionLock>, StateError> {
        let session = self.create_session().await?;

        let acquired = match self.try_acquire(key, &session).await {
            Ok(true) => Ok(true),
            Ok(false) => match self.wait_for_release(key, wait).await {
                Ok(()) => self.try_acquire(key, &session).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match acquired {
            Ok(true) => {
                debug!("Acquired Consul lock {} with session {}", key, session);
                Ok(Some(self.hold(key, session)))
            }
            Ok(false) => {
                debug!("Consul lock {} is held by another session", key);
                if let Err(e) = self.destroy_session(&session).await {
                    debug!("Failed to destroy unused session {}: {}", session, e);
                }
                Ok(None)
            }
            Err(e) => {
                if let Err(destroy_err) = self.destroy_session(&session).await {
                    debug!("Failed to destroy session {}: {}", session, destroy_err);
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, lock), level = "debug", fields(key = lock.key()))]
    async fn unlock(&self, lock: SessionLock) -> Result<(), StateError> {
        let url = self.kv_url(lock.key());
        let released = match self
            .send(
                self.request(Method::PUT, &url)
                    .query(&[("release", lock.session())]),
                "lock release",
            )
            .await
        {
            Ok(response) => match Self::check_status(response, "lock release").await {
                Ok(response) => Self::read_bool(response, "lock release").await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        // Only cleanup; fails harmlessly if another client already took over.
        if let Err(e) = self.destroy_session(lock.session()).await {
            debug!("Failed to destroy session {}: {}", lock.session(), e);
        }

        match released {
            Ok(true) => {
                debug!("Released Consul lock {}", lock.key());
                Ok(())
            }
            Ok(false) => Err(StateError::Transport(format!(
                "Consul did not release lock {} for session {}",
                lock.key(),
                lock.session()
            ))),
            Err(e) => Err(e),
        }
    }
}
