//! Persisted endpoint configuration store
//!
//! One JSON file per endpoint under a per-kind directory:
//! `<root>/webhook/<name>.json` for HTTP endpoints and
//! `<root>/websocket/<name>.json` for WebSocket server/client endpoints.
//!
//! Writes are atomic (write-temp-then-rename) so a crash mid-write never
//! leaves a corrupt config for the next restore. Load-all deletes files it
//! cannot parse rather than aborting the whole restore.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{ConfigError, ConfigResult, EndpointConfig, EndpointKind};

/// Directory names scanned on restore
const STORE_DIRS: [&str; 2] = ["webhook", "websocket"];

/// Filesystem store for endpoint configurations
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    /// Create a store rooted at `root`; directories are created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str, kind: EndpointKind) -> PathBuf {
        self.root.join(kind.store_dir()).join(format!("{name}.json"))
    }

    /// Persist a config, atomically, creating directories as needed
    pub fn save(&self, config: &EndpointConfig) -> ConfigResult<()> {
        let path = self.path_for(&config.name, config.kind);
        let dir = path.parent().expect("store path has a parent");
        fs::create_dir_all(dir)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", dir.display())))?;

        let json = serde_json::to_vec_pretty(config)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Write-temp-then-rename keeps the visible file always complete
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", tmp.display())))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;

        debug!(endpoint = %config.name, path = %path.display(), "Persisted endpoint config");
        Ok(())
    }

    /// Remove a persisted config; missing file is not an error
    pub fn delete(&self, name: &str, kind: EndpointKind) -> ConfigResult<()> {
        let path = self.path_for(name, kind);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(endpoint = %name, path = %path.display(), "Removed endpoint config");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::ParseError(format!(
                "{}: {e}",
                path.display()
            ))),
        }
    }

    /// Load one persisted config
    pub fn load(&self, name: &str, kind: EndpointKind) -> ConfigResult<EndpointConfig> {
        let path = self.path_for(name, kind);
        let text = fs::read_to_string(&path)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load every persisted config across all kind directories.
    ///
    /// A file that fails to parse is deleted and skipped so one corrupt
    /// entry cannot block restoring the others.
    pub fn load_all(&self) -> Vec<EndpointConfig> {
        let mut configs = Vec::new();

        for dir_name in STORE_DIRS {
            let dir = self.root.join(dir_name);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(directory = %dir.display(), error = %e, "Failed to read config directory");
                    continue;
                }
            };

            for entry in entries {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "Failed to read directory entry");
                        continue;
                    }
                };
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }

                match fs::read_to_string(&path)
                    .map_err(|e| ConfigError::ParseError(e.to_string()))
                    .and_then(|text| {
                        serde_json::from_str::<EndpointConfig>(&text)
                            .map_err(|e| ConfigError::ParseError(e.to_string()))
                    }) {
                    Ok(config) => configs.push(config),
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Deleting unreadable endpoint config"
                        );
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }

        configs
    }
}
