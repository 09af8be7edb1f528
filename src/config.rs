//! Layered runtime configuration.
//!
//! Defaults are overlaid by an optional TOML file, which is overlaid by
//! command-line flags / environment variables (see [`crate::cli::Args`]).
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! static_dir = "public"
//!
//! [hub]
//! max_history = 100
//! echo_to_sender = true
//! announce_departures = false
//! outbound_queue = 256
//! command_queue = 1024
//!
//! [limits]
//! max_username_chars = 64
//! max_text_chars = 4000
//! max_media_bytes = 10485760
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::error::RelayError;

/// Default number of messages kept in the history buffer.
pub const MAX_HISTORY: usize = 100;

/// Port used when neither the flag, `PORT` nor the config file set one.
pub const DEFAULT_PORT: u16 = 3000;

/// Listener and static-file settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served for non-WebSocket GET requests.
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            static_dir: PathBuf::from("public"),
        }
    }
}

/// Behaviour of the broadcast hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub max_history: usize,
    /// Deliver a sender's own message back to it.
    pub echo_to_sender: bool,
    /// Broadcast `userLeft` when a named connection goes away.
    pub announce_departures: bool,
    /// Per-connection outbound queue capacity, in events.
    pub outbound_queue: usize,
    /// Capacity of the hub's inbound command queue. Sessions wait when it
    /// is full.
    pub command_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_history: MAX_HISTORY,
            echo_to_sender: true,
            announce_departures: false,
            outbound_queue: 256,
            command_queue: 1024,
        }
    }
}

/// Payload limits enforced when decoding client frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_username_chars: usize,
    pub max_text_chars: usize,
    pub max_media_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_username_chars: 64,
            max_text_chars: 4000,
            max_media_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub limits: Limits,
}

impl RelayConfig {
    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, RelayError> {
        let config: RelayConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Build the effective configuration from parsed command-line arguments.
    pub fn load(args: &Args) -> Result<Self, RelayError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Overlay explicitly provided flags / environment values.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(ref host) = args.host {
            self.server.host = host.clone();
        }
        if let Some(ref dir) = args.static_dir {
            self.server.static_dir = dir.clone();
        }
        if args.no_echo {
            self.hub.echo_to_sender = false;
        }
        if args.announce_departures {
            self.hub.announce_departures = true;
        }
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.hub.max_history == 0 {
            return Err(RelayError::Config("hub.max_history must be at least 1".into()));
        }
        if self.hub.outbound_queue == 0 {
            return Err(RelayError::Config("hub.outbound_queue must be at least 1".into()));
        }
        if self.hub.command_queue == 0 {
            return Err(RelayError::Config("hub.command_queue must be at least 1".into()));
        }
        if self.limits.max_username_chars == 0 {
            return Err(RelayError::Config(
                "limits.max_username_chars must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = RelayConfig::default();
        assert_eq!(c.server.port, 3000);
        assert_eq!(c.server.host, "0.0.0.0");
        assert_eq!(c.hub.max_history, 100);
        assert!(c.hub.echo_to_sender);
        assert!(!c.hub.announce_departures);
        assert_eq!(c.limits.max_media_bytes, 10_485_760);
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let c = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(c, RelayConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let c = RelayConfig::from_toml_str("[hub]\nmax_history = 5\n").unwrap();
        assert_eq!(c.hub.max_history, 5);
        assert_eq!(c.hub.outbound_queue, 256);
        assert_eq!(c.hub.command_queue, 1024);
        assert_eq!(c.server.port, 3000);
    }

    #[test]
    fn test_zero_history_rejected() {
        let err = RelayConfig::from_toml_str("[hub]\nmax_history = 0\n").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_zero_command_queue_rejected() {
        let err = RelayConfig::from_toml_str("[hub]\ncommand_queue = 0\n").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_bad_toml_is_config_file_error() {
        let err = RelayConfig::from_toml_str("[hub\n").unwrap_err();
        assert!(matches!(err, RelayError::ConfigFile(_)));
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9000\nhost = \"127.0.0.1\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::parse_from(["chat-relay", "--config", &path, "--port", "4000"]);
        let c = RelayConfig::load(&args).unwrap();
        assert_eq!(c.server.port, 4000);
        assert_eq!(c.server.host, "127.0.0.1");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let args = Args::parse_from(["chat-relay", "--config", "/definitely/not/here.toml"]);
        assert!(matches!(RelayConfig::load(&args), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_bind_addr() {
        let mut c = RelayConfig::default();
        c.server.host = "127.0.0.1".into();
        c.server.port = 1234;
        assert_eq!(c.bind_addr(), "127.0.0.1:1234");
    }
}
