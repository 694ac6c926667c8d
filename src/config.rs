//! Node configuration.
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! none at all) is valid. `FEDSTORE_HOST` and `FEDSTORE_PORT` override the
//! listen address after loading.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::FrameLimits;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface to bind
    pub host: String,

    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,

    /// Address announced to peers in the server handshake.
    /// Defaults to the bound socket address, which is only dialable when
    /// `host` is a concrete interface.
    pub advertise_addr: Option<String>,

    /// Concurrent client connections accepted before handshakes are refused
    pub max_clients: usize,

    /// Largest object payload accepted by PUT
    pub max_payload_bytes: usize,

    /// Longest accepted message line
    pub max_line_bytes: usize,

    /// Deadline for payload reads and peer round trips, in milliseconds
    pub io_timeout_ms: u64,

    /// Group member to join at startup (`host:port`)
    pub seed: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let limits = FrameLimits::default();
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            advertise_addr: None,
            max_clients: 64,
            max_payload_bytes: limits.max_payload_bytes,
            max_line_bytes: limits.max_line_bytes,
            io_timeout_ms: limits.io_timeout.as_millis() as u64,
            seed: None,
        }
    }
}

impl Config {
    /// Read and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FEDSTORE_HOST` / `FEDSTORE_PORT` if set.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("FEDSTORE_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("FEDSTORE_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("FEDSTORE_PORT is not a port number: {}", port))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("host cannot be empty");
        }
        if self.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }
        if self.max_payload_bytes == 0 {
            bail!("max_payload_bytes must be at least 1");
        }
        if self.max_line_bytes == 0 {
            bail!("max_line_bytes must be at least 1");
        }
        if self.io_timeout_ms == 0 {
            bail!("io_timeout_ms must be at least 1");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_line_bytes: self.max_line_bytes,
            max_payload_bytes: self.max_payload_bytes,
            io_timeout: self.io_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "127.0.0.1:7070");
        assert_eq!(config.frame_limits(), FrameLimits::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9100").unwrap();
        writeln!(file, "max_clients = 5").unwrap();
        writeln!(file, "seed = \"127.0.0.1:9000\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.max_clients, 5);
        assert_eq!(config.seed.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_clients = 0").unwrap();
        assert!(Config::load(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_payload_bytes = 0").unwrap();
        assert!(Config::load(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load("/nonexistent/fedstore.toml").is_err());
    }
}
