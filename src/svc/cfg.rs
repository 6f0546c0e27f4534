//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_IMAGE_PREFIX: &str = "registry.developers.crunchydata.com/crunchydata";
pub const DEFAULT_IMAGE_NAME: &str = "crunchy-pgadmin4";
pub const DEFAULT_CONSOLE_PORT: &str = "5050";
pub const DEFAULT_READINESS_TIMEOUT: u64 = 60;
pub const DEFAULT_READINESS_INTERVAL: u64 = 3;
pub const DEFAULT_STORAGE_SIZE: &str = "1Gi";
pub const DEFAULT_STORAGE_ACCESS_MODE: &str = "ReadWriteOnce";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
    #[serde(rename = "debug", default)]
    pub debug: bool,
    #[serde(rename = "namespace", default)]
    pub namespace: Option<String>,
}

// -----------------------------------------------------------------------------
// Console structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Console {
    #[serde(rename = "image_prefix")]
    pub image_prefix: String,
    #[serde(rename = "image_name")]
    pub image_name: String,
    #[serde(rename = "image_override", default)]
    pub image_override: Option<String>,
    #[serde(rename = "disable_security_context", default)]
    pub disable_security_context: bool,
    #[serde(rename = "port")]
    pub port: String,
    #[serde(rename = "service_port")]
    pub service_port: String,
    #[serde(rename = "templates", default)]
    pub templates: Option<PathBuf>,
}

// -----------------------------------------------------------------------------
// Readiness structure

/// durations are expressed in seconds
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Readiness {
    #[serde(rename = "timeout")]
    pub timeout: u64,
    #[serde(rename = "interval")]
    pub interval: u64,
}

impl Readiness {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

// -----------------------------------------------------------------------------
// Storage structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Storage {
    #[serde(rename = "size")]
    pub size: String,
    #[serde(rename = "access_mode")]
    pub access_mode: String,
    #[serde(rename = "storage_class", default)]
    pub storage_class: Option<String>,
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load file '{0:?}', {1}")]
    File(PathBuf, ConfigError),
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Cast(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("readiness interval must be greater than zero")]
    Interval,
}

// -----------------------------------------------------------------------------
// Configuration structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "console")]
    pub console: Console,
    #[serde(rename = "readiness")]
    pub readiness: Readiness,
    #[serde(rename = "storage")]
    pub storage: Storage,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        let builder = defaults(Config::builder())?
            .add_source(File::from(path.to_owned()).required(true))
            .add_source(environment());

        let config = builder.build().map_err(|err| Error::File(path, err))?;

        Self::cast(config)
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let mut builder = defaults(Config::builder())?;

        let mut paths = vec![
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
        ];

        if let Some(home) = std::env::var_os("HOME") {
            paths.push(
                PathBuf::from(home)
                    .join(".config")
                    .join(env!("CARGO_PKG_NAME"))
                    .join("config"),
            );
        }

        paths.push(PathBuf::from("config"));

        for path in paths {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config = builder
            .add_source(environment())
            .build()
            .map_err(Error::Build)?;

        Self::cast(config)
    }

    fn cast(config: Config) -> Result<Self, Error> {
        let configuration: Self = config.try_deserialize().map_err(Error::Cast)?;

        if configuration.readiness.interval == 0 {
            return Err(Error::Interval);
        }

        Ok(configuration)
    }

    /// logs the effective configuration, secrets excluded as there is none
    pub fn help(&self) {
        info!(
            listen = self.operator.listen.to_string(),
            debug = self.operator.debug,
            namespace = self.operator.namespace.as_deref().unwrap_or("<all>"),
            image = format!("{}/{}", self.console.image_prefix, self.console.image_name),
            templates = self
                .console
                .templates
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<builtin>".to_string()),
            readiness_timeout = self.readiness.timeout,
            readiness_interval = self.readiness.interval,
            "Loaded configuration",
        );
    }
}

// -----------------------------------------------------------------------------
// helpers

fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_"))
        .prefix_separator("_")
        .separator("__")
}

fn defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, Error> {
    let entries: [(&str, config::Value); 11] = [
        ("operator.listen", DEFAULT_LISTEN.into()),
        ("operator.debug", false.into()),
        ("console.image_prefix", DEFAULT_IMAGE_PREFIX.into()),
        ("console.image_name", DEFAULT_IMAGE_NAME.into()),
        ("console.disable_security_context", false.into()),
        ("console.port", DEFAULT_CONSOLE_PORT.into()),
        ("console.service_port", DEFAULT_CONSOLE_PORT.into()),
        ("readiness.timeout", (DEFAULT_READINESS_TIMEOUT as i64).into()),
        ("readiness.interval", (DEFAULT_READINESS_INTERVAL as i64).into()),
        ("storage.size", DEFAULT_STORAGE_SIZE.into()),
        ("storage.access_mode", DEFAULT_STORAGE_ACCESS_MODE.into()),
    ];

    entries
        .into_iter()
        .try_fold(builder, |builder, (key, value)| {
            builder
                .set_default(key, value)
                .map_err(|err| Error::Default(key.to_string(), err))
        })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = defaults(Config::builder())
            .expect("defaults to be valid")
            .build()
            .expect("configuration to build");

        let configuration = Configuration::cast(config).expect("defaults to deserialize");

        assert_eq!(configuration.console.port, DEFAULT_CONSOLE_PORT);
        assert_eq!(configuration.readiness.timeout(), Duration::from_secs(60));
        assert_eq!(configuration.readiness.interval(), Duration::from_secs(3));
        assert_eq!(configuration.storage.access_mode, DEFAULT_STORAGE_ACCESS_MODE);
        assert!(configuration.console.image_override.is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("temporary directory to be created");
        let path = dir.path().join("config.toml");

        let mut file = std::fs::File::create(&path).expect("file to be created");
        writeln!(file, "[console]\nimage_override = \"example.org/console:1\"\n[readiness]\ninterval = 5")
            .expect("file to be written");

        let configuration = Configuration::try_from(path).expect("configuration to load");

        assert_eq!(
            configuration.console.image_override.as_deref(),
            Some("example.org/console:1")
        );
        assert_eq!(configuration.readiness.interval, 5);
        assert_eq!(configuration.readiness.timeout, DEFAULT_READINESS_TIMEOUT);
    }
}
