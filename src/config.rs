//! Configuration for the store.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Name of the optional config file.
pub const CONFIG_FILE_NAME: &str = "cellstore.config.toml";

/// Prefix for environment variables overriding config fields.
///
/// For example, `CELLSTORE_DATABASE=http://localhost:5522` sets [`Config::database`].
pub const ENV_PREFIX: &str = "CELLSTORE";

/// Store configuration.
///
/// The default is a standalone store: no remote tiers, no database, and local memory as the
/// persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Local cache behaviour.
    pub buffer: BufferConfig,
    /// Remote buffer folders and servers.
    pub remote: RemoteConfig,
    /// URL of the database. `None` disables every database relation.
    pub database: Option<Url>,
    /// Transformation cache behaviour.
    pub transformation: TransformationConfig,
}

/// Local buffer cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// How long unreferenced buffers of at least `small_buffer_limit` bytes stay in memory.
    #[serde(with = "humantime_serde")]
    pub lifetime_temp: Duration,
    /// How long unreferenced small buffers stay in memory.
    #[serde(with = "humantime_serde")]
    pub lifetime_temp_small: Duration,
    /// Buffers below this size use `lifetime_temp_small`.
    pub small_buffer_limit: usize,
    /// Keep every referenced buffer in memory unless the remote tier can serve it.
    ///
    /// When disabled, only buffers referenced as persistent get that protection.
    pub local_mode_full_persistence: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            lifetime_temp: Duration::from_secs(20),
            lifetime_temp_small: Duration::from_secs(600),
            small_buffer_limit: 100_000,
            local_mode_full_persistence: true,
        }
    }
}

/// Remote tier settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Folders holding buffers named by their hex checksum.
    pub read_folders: Vec<PathBuf>,
    /// Buffer servers to read from.
    pub read_servers: Vec<Url>,
    /// The single buffer server to write to.
    pub write_server: Option<Url>,
    /// How long a reader waits for a folder lock to disappear.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Interval between two lock checks.
    #[serde(with = "humantime_serde")]
    pub lock_poll_interval: Duration,
    /// Attempts for a write that fails with a transient error.
    pub write_retries: usize,
    /// Attempts when probing a server or database before giving up.
    pub connect_trials: usize,
    /// Timeout of a probe request.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            read_folders: Vec::new(),
            read_servers: Vec::new(),
            write_server: None,
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(500),
            write_retries: 10,
            connect_trials: 5,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Transformation cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformationConfig {
    /// Delay before an unreferenced transformation is destroyed.
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Delay used instead when its job has been running for longer than `long_job`.
    #[serde(with = "humantime_serde")]
    pub keep_alive_long: Duration,
    #[serde(with = "humantime_serde")]
    pub long_job: Duration,
    /// Forget results once they are written to the database.
    pub stateless: bool,
    /// Interval at which waiting callers check on a running job.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for TransformationConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(1),
            keep_alive_long: Duration::from_secs(20),
            long_job: Duration::from_secs(20),
            stateless: false,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Config {
    /// Loads the config from a TOML file, then applies environment overrides.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let mut config: Config = toml::from_str(&s)?;
        config.apply_env(ENV_PREFIX)?;
        Ok(config)
    }

    /// Loads `path` if it exists, else starts from the defaults. Environment overrides apply
    /// in both cases.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => {
                Self::load(path).await
            }
            _ => {
                let mut config = Config::default();
                config.apply_env(ENV_PREFIX)?;
                Ok(config)
            }
        }
    }

    /// Applies `<PREFIX>_*` environment variables.
    ///
    /// Lists are comma separated.
    pub fn apply_env(&mut self, prefix: &str) -> Result<()> {
        let var = |name: &str| env::var(format!("{prefix}_{name}")).ok();
        if let Some(v) = var("DATABASE") {
            self.database = Some(v.parse().context("invalid database url")?);
        }
        if let Some(v) = var("READ_SERVERS") {
            self.remote.read_servers = split_list(&v)
                .map(|s| s.parse().context("invalid read server url"))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = var("READ_FOLDERS") {
            self.remote.read_folders = split_list(&v).map(PathBuf::from).collect();
        }
        if let Some(v) = var("WRITE_SERVER") {
            self.remote.write_server = Some(v.parse().context("invalid write server url")?);
        }
        if let Some(v) = var("LOCAL_MODE_FULL_PERSISTENCE") {
            self.buffer.local_mode_full_persistence =
                v.parse().context("invalid LOCAL_MODE_FULL_PERSISTENCE")?;
        }
        if let Some(v) = var("STATELESS") {
            self.transformation.stateless = v.parse().context("invalid STATELESS")?;
        }
        debug!(?self, "config after environment overrides");
        Ok(())
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn load_partial_file() -> Result<()> {
        let dir = testdir::testdir!();
        let path = dir.join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
database = "http://localhost:5522/"

[buffer]
lifetime_temp_small = "5m"
local_mode_full_persistence = false

[remote]
read_servers = ["http://localhost:5577/"]
"#,
        )
        .await?;
        let config = Config::load(&path).await?;
        assert_eq!(config.buffer.lifetime_temp_small, Duration::from_secs(300));
        assert_eq!(config.buffer.lifetime_temp, Duration::from_secs(20));
        assert!(!config.buffer.local_mode_full_persistence);
        assert_eq!(config.remote.read_servers.len(), 1);
        assert_eq!(config.remote.write_retries, 10);
        assert_eq!(
            config.database.as_ref().map(Url::as_str),
            Some("http://localhost:5522/")
        );
        Ok(())
    }

    #[test]
    fn env_overrides() -> Result<()> {
        let prefix = "CELLSTORE_TEST_ENV_OVERRIDES";
        env::set_var(format!("{prefix}_READ_FOLDERS"), "/a, /b");
        env::set_var(format!("{prefix}_STATELESS"), "true");
        let mut config = Config::default();
        config.apply_env(prefix)?;
        assert_eq!(
            config.remote.read_folders,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert!(config.transformation.stateless);
        Ok(())
    }

    #[test]
    fn defaults_roundtrip_through_toml() -> Result<()> {
        let config = Config::default();
        let s = toml::to_string(&config)?;
        let back: Config = toml::from_str(&s)?;
        assert_eq!(back, config);
        Ok(())
    }
}
