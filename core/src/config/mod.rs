pub mod settings;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// The broker's own channel name; requests targeting it are handled
    /// in-process.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Bind a local stream socket at this path instead of TCP.
    pub socket_path: Option<String>,
    pub max_connections: usize,
    /// Upper bound on `totalLen`; oversized frames close the peer.
    pub max_frame_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "broker".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7171,
            socket_path: None,
            max_connections: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl BrokerConfig {
    /// Listen on a unix socket path instead of TCP.
    pub fn with_socket_path(mut self, path: &str) -> Self {
        self.socket_path = Some(path.to_string());
        self
    }

    /// Validate configuration bounds before the server starts.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.max_frame_size < 64 {
            return Err("max_frame_size must be >= 64".to_string());
        }
        Ok(())
    }
}
