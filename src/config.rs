//! Bridge configuration file.
//!
//! ```toml
//! listen = "127.0.0.1:7878"
//! max_frame_size = 104857600
//! accept_backoff_ms = 50
//! hardware_slots = 4
//! max_hits_per_breakpoint = 1000
//! ```

use crate::muted_error;
use crate::resource::breakpoint::{DEFAULT_MAX_HITS, DEFAULT_SLOTS};
use crate::transport::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::transport::{Endpoint, TransportOptions};
use anyhow::Context;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7878";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// `host:port`, `tcp:host:port` or `unix:/path`.
    pub listen: String,
    pub max_frame_size: u32,
    pub accept_backoff_ms: u64,
    pub hardware_slots: usize,
    pub max_hits_per_breakpoint: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            accept_backoff_ms: 50,
            hardware_slots: DEFAULT_SLOTS,
            max_hits_per_breakpoint: DEFAULT_MAX_HITS,
        }
    }
}

impl BridgeConfig {
    const DEFAULT_PATH: &'static str = ".config/cebridge/config.toml";

    /// Load configuration from `path`, or from the default location in the home directory.
    ///
    /// A missing default file yields the default configuration, a missing explicit file
    /// is an error.
    pub fn from_file(path: Option<&Path>) -> anyhow::Result<Self> {
        let data = match path {
            None => {
                let Some(home) = home::home_dir() else {
                    return Ok(Self::default());
                };
                match muted_error!(read_to_string(home.join(Self::DEFAULT_PATH))) {
                    Some(data) => data,
                    None => return Ok(Self::default()),
                }
            }
            Some(path) => read_to_string(path)
                .with_context(|| format!("read config file {}", path.display()))?,
        };

        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        let config: Self = toml::de::from_str(data).context("parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.hardware_slots > 0, "hardware_slots must be positive");
        anyhow::ensure!(self.max_frame_size > 1, "max_frame_size is too small");
        self.endpoint()?;
        Ok(())
    }

    pub fn endpoint(&self) -> anyhow::Result<Endpoint> {
        Endpoint::from_str(&self.listen).with_context(|| format!("listen address `{}`", self.listen))
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            max_frame_size: self.max_frame_size,
            accept_backoff: Duration::from_millis(self.accept_backoff_ms),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen = \"unix:/tmp/cebridge.sock\"").unwrap();
        writeln!(file, "hardware_slots = 2").unwrap();

        let config = BridgeConfig::from_file(Some(file.path())).unwrap();
        assert_eq!(config.hardware_slots, 2);
        assert_eq!(config.max_hits_per_breakpoint, DEFAULT_MAX_HITS);
        assert_eq!(
            config.endpoint().unwrap(),
            Endpoint::Unix("/tmp/cebridge.sock".into())
        );
        assert_eq!(config.transport_options().accept_backoff, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_files() {
        struct TestCase {
            data: &'static str,
        }
        let cases = [
            TestCase {
                data: "hardware_slots = 0",
            },
            TestCase {
                data: "listen = \"nowhere\"",
            },
            TestCase {
                data: "unknown_key = 1",
            },
            TestCase {
                data: "hardware_slots = \"four\"",
            },
        ];

        for tc in cases {
            assert!(BridgeConfig::from_toml(tc.data).is_err(), "{}", tc.data);
        }
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BridgeConfig::from_file(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
