//! Configuration for named disks.
//!
//! A [`Config`] is a table of disks keyed by name, each naming a `driver`
//! plus that driver's settings:
//!
//! ```toml
//! [disks.local]
//! driver = "local"
//! root = "/srv/files"
//! dir_mode = 0o750
//!
//! [disks.media]
//! driver = "s3"
//! endpoint = "http://localhost:9000"
//! bucket = "media"
//! prefix = "tenant-42"
//! path_style = true
//! read_only = true
//! ```
//!
//! Values are read from a file (format chosen by extension), then overridden
//! by `DEPOT_`-prefixed environment variables with nested keys separated by
//! `__`, e.g. `DEPOT_DISKS__MEDIA__SECRET_KEY`.

pub mod error;

use crate::error::{ErrorKind, Result};
use depot_storage::backend::{LocalBackend, LocalConfig, ReadOnlyBackend, S3Config};
use depot_storage::{BackendHandle, Storage};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "DEPOT_";
const CONFIG_FILE_NAME: &str = "depot.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub disks: BTreeMap<String, DiskConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DiskConfig {
    /// Wrap the backend so every write is refused.
    #[serde(default)]
    pub read_only: bool,
    #[serde(flatten)]
    pub driver: Driver,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum Driver {
    Local(LocalConfig),
    S3(S3Config),
}
impl Driver {
    fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::S3(_) => "s3",
        }
    }
}

impl Config {
    /// Load configuration from `path`, then apply environment overrides.
    ///
    /// A missing file is not an error: the configuration then comes from the
    /// environment alone.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading configuration");
        Self::figment(path)?.extract().or_raise(|| ErrorKind::Load)
    }

    /// The layered providers [`load()`](Self::load) extracts from, for
    /// callers that want to merge in providers of their own.
    pub fn figment(path: &Path) -> Result<Figment> {
        let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
        let figment = match extension.as_deref() {
            Some("toml") => Figment::from(Toml::file(path)),
            Some("yaml" | "yml") => Figment::from(Yaml::file(path)),
            Some("json") => Figment::from(Json::file(path)),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
        };
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Platform configuration location, e.g. `~/.config/depot/depot.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "depot").ok_or_raise(|| ErrorKind::NoConfigDirectory)?;
        Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Build every configured disk and register it under its name.
    pub fn into_storage(self) -> Result<Storage> {
        let storage = Storage::new();
        for (name, disk) in self.disks {
            let backend = disk.build(&name)?;
            storage.add_disk(name, backend);
        }
        Ok(storage)
    }
}

impl DiskConfig {
    /// Construct the backend for a disk registered under `name`.
    pub fn build(self, name: &str) -> Result<BackendHandle> {
        tracing::debug!(disk = name, driver = self.driver.name(), read_only = self.read_only, "Creating disk");
        let backend: BackendHandle = match self.driver {
            Driver::Local(config) => {
                Arc::new(LocalBackend::new(name, config).or_raise(|| ErrorKind::Disk(name.to_string()))?)
            },
            #[cfg(feature = "s3")]
            Driver::S3(config) => Arc::new(
                depot_storage::backend::S3Backend::new(name, config).or_raise(|| ErrorKind::Disk(name.to_string()))?,
            ),
            #[cfg(not(feature = "s3"))]
            Driver::S3(_) => exn::bail!(ErrorKind::DriverUnavailable {
                disk: name.to_string(),
                driver: "s3",
            }),
        };
        Ok(match self.read_only {
            true => Arc::new(ReadOnlyBackend::new(backend)),
            false => backend,
        })
    }
}
