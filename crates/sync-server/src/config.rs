//! Server configuration.

use crate::store::StoreBackend;
use std::path::PathBuf;
use std::time::Duration;

/// Default address for the sync socket.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

/// Default time a new connection has to send its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: String,
    /// Directory for per-user JSON stores. `None` keeps notes in memory.
    pub data_dir: Option<PathBuf>,
    /// Connections that stay silent this long after connecting are closed.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            data_dir: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn store_backend(&self) -> StoreBackend {
        match &self.data_dir {
            Some(dir) => StoreBackend::Files(dir.clone()),
            None => StoreBackend::Memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "127.0.0.1:8787");
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.store_backend(), StoreBackend::Memory);
    }

    #[test]
    fn test_data_dir_selects_file_store() {
        let config = ServerConfig {
            data_dir: Some(PathBuf::from("/var/lib/notes")),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.store_backend(),
            StoreBackend::Files(PathBuf::from("/var/lib/notes"))
        );
    }
}
