//! Settings for S3-compatible disks.
//!
//! Always compiled, so configuration naming an `s3` disk can be parsed (and
//! rejected with a useful message) even when the backend itself is not.

use serde::Deserialize;
use std::fmt::{self, Debug, Formatter};

/// Configuration for an S3-compatible disk.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct S3Config {
    /// Custom endpoint URL for S3-compatible services. Leave unset for AWS.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    pub bucket: String,
    /// Key prefix every path is stored under (acts as a virtual directory).
    #[serde(default)]
    pub prefix: Option<String>,
    /// Use path-style addressing (`endpoint/bucket/key`), required by MinIO
    /// and most self-hosted services.
    #[serde(default)]
    pub path_style: bool,
}
impl S3Config {
    /// Region used when none is configured.
    pub const DEFAULT_REGION: &str = "us-east-1";

    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            access_key: None,
            secret_key: None,
            session_token: None,
            bucket: bucket.into(),
            prefix: None,
            path_style: false,
        }
    }
}
impl Debug for S3Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("path_style", &self.path_style)
            .finish()
    }
}

fn default_region() -> String {
    S3Config::DEFAULT_REGION.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = S3Config::new("bucket");
        config.access_key = Some("AKIDEXAMPLE".to_string());
        config.secret_key = Some("hunter2".to_string());
        let debug = format!("{config:?}");
        assert!(debug.contains("AKIDEXAMPLE"));
        assert!(!debug.contains("hunter2"));
    }
}
