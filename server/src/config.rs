use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::messages::DEFAULT_MAX_FRAME_LEN;

/// Server configuration. The binary fills it from CLI flags; tests build it
/// directly with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the acceptor binds to.
    pub listen_addr: SocketAddr,
    /// Root of everything the server persists.
    pub data_dir: PathBuf,
    // Channel capacities stay private so they can never be zero.
    inbound_capacity: usize,
    outbound_capacity: usize,
    /// How long a single socket write may take before the connection is dropped.
    pub write_timeout: Duration,
    /// Largest frame body accepted from a client, in bytes.
    pub max_frame_len: usize,
    /// Failed `/login` attempts tolerated before the connection is closed.
    pub max_login_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from("server_data"),
            inbound_capacity: 256,
            outbound_capacity: 64,
            write_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_login_attempts: 3,
        }
    }
}

impl ServerConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Capacity of the shared inbound channel. Readers block once it is full,
    /// so this bounds how far connections can run ahead of the processor.
    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    /// Capacity of each connection's outbound queue.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn inbound_capacity(&self) -> usize {
        self.inbound_capacity
    }

    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    pub fn with_max_login_attempts(mut self, attempts: u32) -> Self {
        self.max_login_attempts = attempts;
        self
    }

    /// The credential ("shadow") file.
    pub fn shadow_path(&self) -> PathBuf {
        self.data_dir.join("shadow")
    }

    /// Directory holding one marker file per established chat.
    pub fn chat_dir(&self) -> PathBuf {
        self.data_dir.join("chats")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let config = ServerConfig::default().with_data_dir("/tmp/msg");
        assert_eq!(config.shadow_path(), PathBuf::from("/tmp/msg/shadow"));
        assert_eq!(config.chat_dir(), PathBuf::from("/tmp/msg/chats"));
    }

    #[test]
    fn test_channel_capacities_never_zero() {
        let config = ServerConfig::default()
            .with_inbound_capacity(0)
            .with_outbound_capacity(0);
        assert_eq!(config.inbound_capacity(), 1);
        assert_eq!(config.outbound_capacity(), 1);

        let config = ServerConfig::default().with_inbound_capacity(8);
        assert_eq!(config.inbound_capacity(), 8);
        assert_eq!(config.outbound_capacity(), 64);
    }
}
