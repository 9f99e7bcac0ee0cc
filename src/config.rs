// Copyright 2020 Joyent, Inc.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:2030";
pub const DEFAULT_PORT: u16 = 2030;
pub const DEFAULT_KEY_LENGTH: usize = 16;
pub const URL_SCHEME: &str = "fast";

/// Settings shared by the serving and calling sides. Every field has a
/// default, so an empty JSON object is a valid configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    pub listen_address: String,
    /// Base URL peers use to reach this process. Derived from
    /// `listen_address` when absent.
    pub public_url: Option<String>,
    /// Length of the random body of generated keys.
    pub key_length: usize,
    /// Precomputed basic auth token attached to outgoing calls.
    pub basic_auth: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_address: String::from(DEFAULT_LISTEN_ADDRESS),
            public_url: None,
            key_length: DEFAULT_KEY_LENGTH,
            basic_auth: None,
            connect_timeout_ms: None,
            read_timeout_ms: None,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Config, Error> {
        serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("unable to read {}: {}", path.display(), e))
        })?;
        Config::from_json(&text)
    }

    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("{}://{}", URL_SCHEME, self.listen_address),
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_object_is_all_defaults() {
        let config = Config::from_json("{}").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.public_url(), "fast://127.0.0.1:2030");
    }

    #[test]
    fn explicit_public_url_wins() {
        let config = Config::from_json(
            r#"{"listen_address": "0.0.0.0:4000",
                "public_url": "fast://node1.example.com:4000/",
                "read_timeout_ms": 250}"#,
        )
        .unwrap();

        assert_eq!(config.public_url(), "fast://node1.example.com:4000");
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.key_length, DEFAULT_KEY_LENGTH);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(Config::from_json("{"), Err(Error::Config(_))));
    }
}
