use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Configuration for the remote-state client.
#[derive(Parser, Debug, Clone)]
#[command(name = "remote-state")]
#[command(about = "Read, write and lock remote state")]
pub struct Config {
    /// State backend: consul, azure, s3 or http
    #[arg(long, env = "REMOTE_STATE_BACKEND")]
    pub backend: BackendKind,

    /// Consul agent address, Azure account endpoint, S3 endpoint override,
    /// or the state URL for the http backend
    #[arg(long, env = "REMOTE_STATE_ADDRESS")]
    pub address: Option<String>,

    /// Consul KV path, Azure blob name or S3 object key of the state
    #[arg(long, env = "REMOTE_STATE_PATH")]
    pub path: Option<String>,

    /// Azure container or S3 bucket
    #[arg(long, env = "REMOTE_STATE_CONTAINER")]
    pub container: Option<String>,

    /// Consul ACL token or Azure SAS token
    #[arg(long, env = "REMOTE_STATE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Consul datacenter
    #[arg(long, env = "REMOTE_STATE_DATACENTER")]
    pub datacenter: Option<String>,

    /// AWS region for the s3 backend (defaults to the AWS environment)
    #[arg(long, env = "REMOTE_STATE_REGION")]
    pub region: Option<String>,

    /// Gzip state before writing it (consul and s3)
    #[arg(long, env = "REMOTE_STATE_GZIP")]
    pub gzip: bool,

    /// Snapshot the Azure blob before each overwrite
    #[arg(long, env = "REMOTE_STATE_SNAPSHOT")]
    pub snapshot: bool,

    /// How long to wait for a held Consul lock (milliseconds)
    #[arg(long, default_value = "1000", env = "REMOTE_STATE_LOCK_WAIT_MS")]
    pub lock_wait_ms: u64,

    /// Accept any TLS certificate
    #[arg(long, env = "REMOTE_STATE_SKIP_CERT_VERIFICATION")]
    pub skip_cert_verification: bool,

    /// Request timeout for HTTP-based backends (seconds)
    #[arg(long, default_value = "30", env = "REMOTE_STATE_TIMEOUT")]
    pub timeout_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch the state and print it, or write it to a file
    Pull {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Upload a state file, holding the lock while writing
    Push {
        file: PathBuf,
        /// Write without taking the lock
        #[arg(long)]
        no_lock: bool,
    },
    /// Delete the remote state
    Delete,
    /// Take and release the lock, reporting the holder if it is taken
    LockProbe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Consul,
    Azure,
    S3,
    Http,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Consul => write!(f, "consul"),
            BackendKind::Azure => write!(f, "azure"),
            BackendKind::S3 => write!(f, "s3"),
            BackendKind::Http => write!(f, "http"),
        }
    }
}
