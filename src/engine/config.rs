//! OTA Relay Configuration Module
//! Loads and persists config.json and owns every runtime read/write of it

use parking_lot::RwLock;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::updater::ack::AckPolicy;
use super::updater::gate::SecurityPosture;
use super::updater::probe::SourceDescriptor;
use super::updater::state::DistributorState;
use super::updater::version::VersionId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to write config {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Cannot create folder {path}: {source}")]
    FolderError {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "TCU", default)]
    pub tcu: TcuConfig,
    #[serde(rename = "Server", default)]
    pub server: ServerConfig,
    #[serde(rename = "Security", default)]
    pub security: SecurityConfig,
    #[serde(rename = "Folders", default)]
    pub folders: FolderConfig,
    #[serde(rename = "ECU", default)]
    pub ecu: EcuConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcuConfig {
    #[serde(default = "default_version")]
    pub current_version: VersionId,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_stall_timeout")]
    pub download_stall_timeout_seconds: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_seconds: u64,
    #[serde(default = "default_ack_poll_interval")]
    pub ack_poll_interval_seconds: u64,
}

/// Update sources in configured order, stored as `<name>_url` keys
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub checksum_verification_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderConfig {
    #[serde(default = "default_ecu_shared_folder")]
    pub ecu_shared_folder: PathBuf,
    #[serde(default = "default_tcu_download_folder")]
    pub tcu_download_folder: PathBuf,
    #[serde(default = "default_tcu_ack_folder")]
    pub tcu_ack_folder: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuConfig {
    #[serde(default = "default_apply_seconds")]
    pub apply_seconds: u64,
    #[serde(default = "default_ecu_poll_interval")]
    pub poll_interval_seconds: u64,
}

fn default_version() -> VersionId {
    VersionId::new(1, 0)
}

fn default_poll_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    3000
}

fn default_stall_timeout() -> u64 {
    10
}

fn default_ack_timeout() -> u64 {
    30
}

fn default_ack_poll_interval() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_ecu_shared_folder() -> PathBuf {
    PathBuf::from("shared_for_ecu")
}

fn default_tcu_download_folder() -> PathBuf {
    PathBuf::from("tcu_downloads")
}

fn default_tcu_ack_folder() -> PathBuf {
    PathBuf::from("tcu_acks")
}

fn default_apply_seconds() -> u64 {
    2
}

fn default_ecu_poll_interval() -> u64 {
    1
}

impl Default for TcuConfig {
    fn default() -> Self {
        Self {
            current_version: default_version(),
            poll_interval_seconds: default_poll_interval(),
            probe_timeout_ms: default_probe_timeout(),
            download_stall_timeout_seconds: default_stall_timeout(),
            ack_timeout_seconds: default_ack_timeout(),
            ack_poll_interval_seconds: default_ack_poll_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceDescriptor::new("oem", "http://127.0.0.1:5000"),
                SourceDescriptor::new("malicious", "http://127.0.0.1:5001"),
            ],
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            checksum_verification_enabled: true,
        }
    }
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            ecu_shared_folder: default_ecu_shared_folder(),
            tcu_download_folder: default_tcu_download_folder(),
            tcu_ack_folder: default_tcu_ack_folder(),
        }
    }
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            apply_seconds: default_apply_seconds(),
            poll_interval_seconds: default_ecu_poll_interval(),
        }
    }
}

impl Serialize for ServerConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.sources.len()))?;
        for source in &self.sources {
            map.serialize_entry(&format!("{}_url", source.name), &source.endpoint)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SourcesVisitor;

        impl<'de> Visitor<'de> for SourcesVisitor {
            type Value = ServerConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of <name>_url keys")
            }

            // Entries arrive in document order, which is the tie-break order.
            fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<Self::Value, M::Error> {
                let mut sources: Vec<SourceDescriptor> = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, serde_json::Value>()? {
                    let (Some(name), Some(endpoint)) = (key.strip_suffix("_url"), value.as_str())
                    else {
                        continue;
                    };
                    if name.is_empty() {
                        continue;
                    }
                    match sources.iter_mut().find(|s| s.name == name) {
                        Some(existing) => existing.endpoint = endpoint.to_string(),
                        None => sources.push(SourceDescriptor::new(name, endpoint)),
                    }
                }
                Ok(ServerConfig { sources })
            }
        }

        deserializer.deserialize_map(SourcesVisitor)
    }
}

impl FolderConfig {
    /// Resolve relative folders against `base`
    pub fn resolve(&self, base: &Path) -> FolderConfig {
        FolderConfig {
            ecu_shared_folder: base.join(&self.ecu_shared_folder),
            tcu_download_folder: base.join(&self.tcu_download_folder),
            tcu_ack_folder: base.join(&self.tcu_ack_folder),
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [
            self.ecu_shared_folder.as_path(),
            self.tcu_download_folder.as_path(),
            self.tcu_ack_folder.as_path(),
        ]
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save atomically: write a temp file next to `path`, then rename over it
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        let write_error = |source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        std::fs::write(&temp_path, content).map_err(write_error)?;
        std::fs::rename(&temp_path, path).map_err(write_error)?;
        Ok(())
    }

    pub fn posture(&self) -> SecurityPosture {
        SecurityPosture {
            integrity_check_enabled: self.security.checksum_verification_enabled,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.tcu.probe_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.tcu.download_stall_timeout_seconds.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.tcu.poll_interval_seconds.max(1))
    }

    pub fn ack_policy(&self) -> AckPolicy {
        AckPolicy::new(
            Duration::from_secs(self.tcu.ack_timeout_seconds),
            Duration::from_secs(self.tcu.ack_poll_interval_seconds.max(1)),
        )
    }

    pub fn apply_duration(&self) -> Duration {
        Duration::from_secs(self.ecu.apply_seconds)
    }

    pub fn ecu_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ecu.poll_interval_seconds.max(1))
    }
}

/// Single owner of the configuration file
///
/// Readers take snapshots; writers re-read the file, apply their change and
/// persist it, so edits made by another process are not clobbered.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    base_dir: PathBuf,
    inner: RwLock<Config>,
}

impl ConfigStore {
    /// Load `path`, falling back to defaults when the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::load(&path)?
        } else {
            Config::default()
        };
        Ok(Self::with_config(path, config))
    }

    pub fn with_config(path: impl Into<PathBuf>, config: Config) -> Self {
        let path = path.into();
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            path,
            base_dir,
            inner: RwLock::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// One scalar read of the security switch
    pub fn posture(&self) -> SecurityPosture {
        self.inner.read().posture()
    }

    pub fn distributor_state(&self) -> DistributorState {
        DistributorState {
            installed_version: self.inner.read().tcu.current_version,
        }
    }

    /// Folders resolved against the config file's directory
    pub fn folders(&self) -> FolderConfig {
        self.inner.read().folders.resolve(&self.base_dir)
    }

    /// Pick up changes written by other processes
    pub fn reload(&self) -> Result<(), ConfigError> {
        if !self.path.exists() {
            return Ok(());
        }
        let fresh = Config::load(&self.path)?;
        *self.inner.write() = fresh;
        Ok(())
    }

    /// Write the in-memory configuration to disk as is
    pub fn persist(&self) -> Result<(), ConfigError> {
        let config = self.inner.read();
        config.save(&self.path)
    }

    pub fn commit_version(&self, version: VersionId) -> Result<(), ConfigError> {
        self.modify(|config| config.tcu.current_version = version)?;
        info!(%version, "installed version committed");
        Ok(())
    }

    pub fn set_checksum_verification(&self, enabled: bool) -> Result<(), ConfigError> {
        self.modify(|config| config.security.checksum_verification_enabled = enabled)?;
        info!(enabled, "checksum verification toggled");
        Ok(())
    }

    fn modify<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Config),
    {
        let mut config = self.inner.write();
        if self.path.exists() {
            match Config::load(&self.path) {
                Ok(fresh) => *config = fresh,
                Err(e) => warn!(error = %e, "config on disk unreadable, keeping in-memory copy"),
            }
        }

        let mut updated = config.clone();
        change(&mut updated);
        updated.save(&self.path)?;
        *config = updated;
        Ok(())
    }
}

/// Create every configured folder
pub fn ensure_folders(folders: &FolderConfig) -> Result<(), ConfigError> {
    for dir in folders.all() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::FolderError {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Retry folder creation with exponential backoff before giving up
pub async fn ensure_folders_with_backoff(
    folders: &FolderConfig,
    attempts: u32,
    initial_delay: Duration,
) -> Result<(), ConfigError> {
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match ensure_folders(folders) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, retry_in = ?delay, "folder setup failed");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config: Config = serde_json::from_str(r#"{"TCU": {"current_version": "1.4"}}"#).unwrap();

        assert_eq!(config.tcu.current_version, VersionId::new(1, 4));
        assert_eq!(config.tcu.poll_interval_seconds, 10);
        assert!(config.security.checksum_verification_enabled);
        assert_eq!(config.folders.tcu_ack_folder, PathBuf::from("tcu_acks"));
        assert_eq!(config.server.sources.len(), 2);
        assert_eq!(config.ack_policy().max_polls(), 30);
    }

    #[test]
    fn test_server_keys_keep_document_order() {
        let config: Config = serde_json::from_str(
            r#"{"Server": {"oem_url": "http://a", "note": "x", "malicious_url": "http://b", "backup_url": "http://c"}}"#,
        )
        .unwrap();

        let names: Vec<&str> = config.server.sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["oem", "malicious", "backup"]);
    }

    #[test]
    fn test_server_round_trip_uses_url_keys() {
        let json = serde_json::to_value(ServerConfig::default()).unwrap();
        assert_eq!(json["oem_url"], "http://127.0.0.1:5000");
        assert_eq!(json["malicious_url"], "http://127.0.0.1:5001");
    }

    #[test]
    fn test_open_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.json")).unwrap();

        assert_eq!(store.distributor_state().installed_version, VersionId::new(1, 0));
        assert!(store.posture().integrity_check_enabled);
        assert_eq!(
            store.folders().ecu_shared_folder,
            dir.path().join("shared_for_ecu")
        );
    }

    #[test]
    fn test_commit_version_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::open(&path).unwrap();

        store.commit_version(VersionId::new(1, 1)).unwrap();

        assert_eq!(store.distributor_state().installed_version, VersionId::new(1, 1));
        let on_disk = Config::load(&path).unwrap();
        assert_eq!(on_disk.tcu.current_version, VersionId::new(1, 1));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_writes_preserve_external_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        Config::default().save(&path).unwrap();
        let store = ConfigStore::open(&path).unwrap();

        // Another process turns verification off behind our back.
        let mut external = Config::load(&path).unwrap();
        external.security.checksum_verification_enabled = false;
        external.save(&path).unwrap();

        store.commit_version(VersionId::new(1, 2)).unwrap();

        let on_disk = Config::load(&path).unwrap();
        assert!(!on_disk.security.checksum_verification_enabled);
        assert_eq!(on_disk.tcu.current_version, VersionId::new(1, 2));
        assert!(!store.posture().integrity_check_enabled);
    }

    #[test]
    fn test_reload_sees_security_toggle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        Config::default().save(&path).unwrap();
        let store = ConfigStore::open(&path).unwrap();
        let other = ConfigStore::open(&path).unwrap();

        other.set_checksum_verification(false).unwrap();
        assert!(store.posture().integrity_check_enabled);

        store.reload().unwrap();
        assert!(!store.posture().integrity_check_enabled);
    }

    #[test]
    fn test_ensure_folders() {
        let dir = tempdir().unwrap();
        let folders = FolderConfig::default().resolve(dir.path());
        ensure_folders(&folders).unwrap();
        assert!(folders.all().iter().all(|p| p.is_dir()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_folder_backoff_gives_up() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();
        let folders = FolderConfig {
            ecu_shared_folder: blocker.join("shared"),
            ..FolderConfig::default().resolve(dir.path())
        };

        let started = tokio::time::Instant::now();
        let result = ensure_folders_with_backoff(&folders, 3, Duration::from_millis(500)).await;

        assert!(matches!(result, Err(ConfigError::FolderError { .. })));
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }
}
