use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Coordinator-side configuration, loaded from `crucible.toml`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub library: LibraryConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LibraryConfig {
    /// Media roots scanned for candidate files.
    pub directories: Vec<String>,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "crucible.db".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:7230".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Queue draining order, cluster-wide.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileOrder {
    #[default]
    Oldest,
    Newest,
    Largest,
    Smallest,
}

impl FileOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oldest => "oldest",
            Self::Newest => "newest",
            Self::Largest => "largest",
            Self::Smallest => "smallest",
        }
    }
}

impl std::fmt::Display for FileOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The settings every worker receives on registration, versioned by digest.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClusterConfig {
    #[serde(default = "default_min_savings_pct")]
    pub min_savings_pct: f64,
    #[serde(default = "default_encoder_preset")]
    pub encoder_preset: u8,
    #[serde(default)]
    pub skip_audio_transcode: bool,
    #[serde(default)]
    pub file_order: FileOrder,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_liveness_timeout_s")]
    pub liveness_timeout_s: u64,
    #[serde(default = "default_pin_grace_s")]
    pub pin_grace_s: u64,
    #[serde(default)]
    pub testing_mode: bool,
}

fn default_min_savings_pct() -> f64 {
    5.0
}

fn default_encoder_preset() -> u8 {
    8
}

fn default_max_attempts() -> i32 {
    3
}

fn default_liveness_timeout_s() -> u64 {
    30
}

fn default_pin_grace_s() -> u64 {
    60
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_savings_pct: default_min_savings_pct(),
            encoder_preset: default_encoder_preset(),
            skip_audio_transcode: false,
            file_order: FileOrder::Oldest,
            max_attempts: default_max_attempts(),
            liveness_timeout_s: default_liveness_timeout_s(),
            pin_grace_s: default_pin_grace_s(),
            testing_mode: false,
        }
    }
}

impl ClusterConfig {
    /// Stable digest workers use to detect configuration drift.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            library: LibraryConfig {
                directories: Vec::new(),
                db_path: default_db_path(),
            },
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.min_savings_pct < 0.0 || self.cluster.min_savings_pct > 100.0 {
            anyhow::bail!(
                "min_savings_pct must be between 0 and 100, got {}",
                self.cluster.min_savings_pct
            );
        }

        if !(1..=13).contains(&self.cluster.encoder_preset) {
            anyhow::bail!(
                "encoder_preset must be between 1 and 13, got {}",
                self.cluster.encoder_preset
            );
        }

        if self.cluster.max_attempts < 1 {
            anyhow::bail!("max_attempts must be >= 1");
        }

        if self.cluster.liveness_timeout_s < 5 {
            anyhow::bail!(
                "liveness_timeout_s must be >= 5, got {}",
                self.cluster.liveness_timeout_s
            );
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Worker-side configuration, loaded from `crucible-worker.toml`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerConfig {
    pub coordinator_url: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Salt mixed into the worker id so two workers on identically named
    /// hosts stay distinct. Generated and persisted on first run.
    #[serde(default)]
    pub id_salt: Option<String>,
    #[serde(default = "default_idle_poll_s")]
    pub idle_poll_s: u64,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("crucible")
}

fn default_idle_poll_s() -> u64 {
    15
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: WorkerConfig = toml::from_str(&content)?;

        if config.coordinator_url.is_empty() {
            anyhow::bail!("coordinator_url is required");
        }

        if config.id_salt.is_none() {
            config.id_salt = Some(uuid::Uuid::new_v4().simple().to_string());
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(path, content)?;
        }

        Ok(config)
    }

    /// Stable worker id: hostname plus persisted salt, hashed.
    pub fn worker_id(&self) -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let salt = self.id_salt.as_deref().unwrap_or("");
        let mut hasher = Sha256::new();
        hasher.update(host.as_bytes());
        hasher.update(b":");
        hasher.update(salt.as_bytes());
        let digest = hasher.finalize();
        format!("w-{:x}", digest)[..18].to_string()
    }

    pub fn display_name(&self) -> String {
        self.display_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "worker".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_digest_stable() {
        let a = ClusterConfig::default();
        let b = ClusterConfig::default();
        assert_eq!(a.digest(), b.digest());

        let c = ClusterConfig {
            encoder_preset: 6,
            ..Default::default()
        };
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_validate_rejects_bad_preset() {
        let mut config = Config::default();
        config.cluster.encoder_preset = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_order_roundtrip() {
        let order: FileOrder = serde_json::from_str("\"largest\"").unwrap();
        assert_eq!(order, FileOrder::Largest);
        assert_eq!(order.as_str(), "largest");
    }
}
