use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use remote_state_azure::{AzureBlobClient, AzureState};
use remote_state_consul::{ConsulClient, ConsulState, ConsulStateOptions};
use remote_state_core::{Locker, StateStore};
use remote_state_http::HttpState;
use remote_state_s3::{S3Objects, S3State, S3StateOptions};
use tracing::info;

use crate::config::{BackendKind, Config};

const DEFAULT_CONSUL_ADDRESS: &str = "127.0.0.1:8500";

/// The configured backend. Only some backends can lock.
pub enum Backend {
    Consul(ConsulState),
    Azure(AzureState),
    S3(S3State),
    Http(HttpState),
}

impl Backend {
    pub async fn from_config(config: &Config) -> Result<Self> {
        info!("Backend: {}", config.backend);

        let backend = match config.backend {
            BackendKind::Consul => {
                let address = config.address.as_deref().unwrap_or(DEFAULT_CONSUL_ADDRESS);
                let path = require(&config.path, "--path")?;
                info!("  Consul: {} path {}", address, path);

                let mut client = ConsulClient::new(http_client(config)?, address);
                if let Some(token) = &config.token {
                    client = client.with_token(token);
                }
                if let Some(dc) = &config.datacenter {
                    client = client.with_datacenter(dc);
                }

                let options = ConsulStateOptions::new(path)
                    .gzip(config.gzip)
                    .lock_wait(Duration::from_millis(config.lock_wait_ms));
                Backend::Consul(ConsulState::new(Arc::new(client), options)?)
            }
            BackendKind::Azure => {
                let endpoint = require(&config.address, "--address")?;
                let container = require(&config.container, "--container")?;
                let path = require(&config.path, "--path")?;
                info!(
                    "  Azure: {} blob {}/{} (snapshot: {})",
                    endpoint, container, path, config.snapshot
                );

                let client = AzureBlobClient::new(
                    http_client(config)?,
                    endpoint,
                    config.token.clone().unwrap_or_default(),
                );
                Backend::Azure(
                    AzureState::new(Arc::new(client), container, path)?.snapshot(config.snapshot),
                )
            }
            BackendKind::S3 => {
                let bucket = require(&config.container, "--container")?;
                let path = require(&config.path, "--path")?;
                info!("  S3: bucket {} key {}", bucket, path);

                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Some(region) = &config.region {
                    loader = loader.region(Region::new(region.clone()));
                }
                let sdk_config = loader.load().await;

                let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
                if let Some(endpoint) = &config.address {
                    s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
                }
                let s3_client = aws_sdk_s3::Client::from_conf(s3_config.build());

                let options = S3StateOptions::new(path).gzip(config.gzip);
                Backend::S3(S3State::new(
                    Arc::new(S3Objects::new(s3_client, bucket)),
                    options,
                )?)
            }
            BackendKind::Http => {
                let address = require(&config.address, "--address")?;
                info!("  HTTP: {}", address);
                Backend::Http(HttpState::with_client(http_client(config)?, address)?)
            }
        };

        Ok(backend)
    }

    pub fn store(&self) -> &dyn StateStore {
        match self {
            Backend::Consul(state) => state,
            Backend::Azure(state) => state,
            Backend::S3(state) => state,
            Backend::Http(state) => state,
        }
    }

    /// `None` for backends without locking.
    pub fn locker(&self) -> Option<&dyn Locker> {
        match self {
            Backend::Consul(state) => Some(state),
            Backend::Azure(state) => Some(state),
            Backend::S3(state) => Some(state),
            Backend::Http(_) => None,
        }
    }
}

fn require<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{} is required for this backend", flag))
}

fn http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .danger_accept_invalid_certs(config.skip_cert_verification)
        .build()
        .context("Failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["remote-state"];
        argv.extend_from_slice(args);
        argv.push("delete");
        Config::try_parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn test_consul_needs_path() {
        let config = parse(&["--backend", "consul"]);
        let err = Backend::from_config(&config).await.err().unwrap();
        assert!(err.to_string().contains("--path"));
    }

    #[tokio::test]
    async fn test_consul_backend_locks() {
        let config = parse(&["--backend", "consul", "--path", "env/prod"]);
        let backend = Backend::from_config(&config).await.unwrap();
        assert_eq!(backend.store().backend_name(), "consul");
        assert!(backend.locker().is_some());
    }

    #[tokio::test]
    async fn test_http_backend_cannot_lock() {
        let config = parse(&["--backend", "http", "--address", "https://example.com/state"]);
        let backend = Backend::from_config(&config).await.unwrap();
        assert_eq!(backend.store().backend_name(), "http");
        assert!(backend.locker().is_none());
    }

    #[tokio::test]
    async fn test_azure_needs_container() {
        let config = parse(&[
            "--backend",
            "azure",
            "--address",
            "https://acct.blob.core.windows.net",
            "--path",
            "prod.tfstate",
        ]);
        let err = Backend::from_config(&config).await.err().unwrap();
        assert!(err.to_string().contains("--container"));
    }

    #[tokio::test]
    async fn test_azure_backend_locks() {
        let config = parse(&[
            "--backend",
            "azure",
            "--address",
            "https://acct.blob.core.windows.net",
            "--container",
            "tfstate",
            "--path",
            "prod.tfstate",
            "--snapshot",
        ]);
        let backend = Backend::from_config(&config).await.unwrap();
        assert_eq!(backend.store().backend_name(), "azure");
        assert!(backend.locker().is_some());
    }

    #[tokio::test]
    async fn test_http_rejects_bad_address() {
        let config = parse(&["--backend", "http", "--address", "file:///tmp/state"]);
        assert!(Backend::from_config(&config).await.is_err());
    }
}
