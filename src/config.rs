//! Node configuration, loaded once from the environment at process start.
//!
//! An immutable record is threaded explicitly into every subsystem constructor rather than read
//! from the environment ad hoc throughout the code.

use std::path::PathBuf;

use crate::error::{EstuaryError, Result};

pub const ROOT_SERVER_ADDRESS_ENV_VAR: &str = "SPARSE_ROOT_SERVER_ADDRESS";
pub const ROOT_SERVER_PORT_ENV_VAR: &str = "SPARSE_ROOT_SERVER_PORT";
/// Legacy; retained for compatibility but unused. The listener always binds `0.0.0.0` on
/// `root_server_port`.
pub const WORKER_LISTEN_ADDRESS_ENV_VAR: &str = "WORKER_LISTEN_ADDRESS";
pub const WORKER_LISTEN_PORT_ENV_VAR: &str = "WORKER_LISTEN_PORT";
pub const APP_REPO_PATH_ENV_VAR: &str = "SPARSE_APP_REPO_PATH";
pub const DATA_PATH_ENV_VAR: &str = "ESTUARY_DATA_PATH";

const DEFAULT_ROOT_SERVER_PORT: u16 = 50006;
const DEFAULT_WORKER_LISTEN_PORT: u16 = 50007;
const DEFAULT_APP_REPO_PATH: &str = "/usr/lib/estuary/apps";
const DEFAULT_DATA_PATH: &str = "/var/lib/estuary/stats";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub root_server_port: u16,
    pub root_server_address: Option<String>,
    pub worker_listen_address: String,
    pub worker_listen_port: u16,
    pub app_repo_path: PathBuf,
    pub data_path: PathBuf,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let root_server_port = parse_port_env(ROOT_SERVER_PORT_ENV_VAR, DEFAULT_ROOT_SERVER_PORT)?;
        let worker_listen_port = parse_port_env(WORKER_LISTEN_PORT_ENV_VAR, DEFAULT_WORKER_LISTEN_PORT)?;

        Ok(Self {
            root_server_port,
            root_server_address: std::env::var(ROOT_SERVER_ADDRESS_ENV_VAR).ok(),
            worker_listen_address: std::env::var(WORKER_LISTEN_ADDRESS_ENV_VAR)
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            worker_listen_port,
            app_repo_path: std::env::var(APP_REPO_PATH_ENV_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_APP_REPO_PATH)),
            data_path: std::env::var(DATA_PATH_ENV_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_PATH)),
        })
    }

    /// Resolves the `host:port` this node should dial at startup, if any. If
    /// `SPARSE_ROOT_SERVER_ADDRESS` already carries a port (contains `:`), it's used verbatim;
    /// otherwise it's combined with `root_server_port`.
    pub fn parent_addr(&self) -> Option<String> {
        let address = self.root_server_address.as_ref()?;
        if address.contains(':') {
            Some(address.clone())
        } else {
            Some(format!("{address}:{}", self.root_server_port))
        }
    }
}

fn parse_port_env(var: &str, default: u16) -> Result<u16> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u16>()
            .map_err(|e| EstuaryError::Config(format!("{var}={raw:?} is not a valid port: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(EstuaryError::Config(format!("{var} is not valid unicode: {e}"))),
    }
}
