use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::AppConfig;
use crate::error::{Result, RtcError};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: PathBuf,
}

impl ConfigStore {
    /// Open a configuration file, writing defaults if it does not exist
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::write(path, &config).await?;
                info!("Wrote default configuration to {}", path.display());
                config
            }
            Err(e) => return Err(e.into()),
        };

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(raw: &str) -> Result<AppConfig> {
        toml::from_str(raw).map_err(|e| RtcError::Config(e.to_string()))
    }

    async fn write(path: &Path, config: &AppConfig) -> Result<()> {
        let raw = toml::to_string_pretty(config).map_err(|e| RtcError::Config(e.to_string()))?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::write(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            path: self.path.clone(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IceServer;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rtc-session.toml");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(*store.get(), AppConfig::default());

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.session.max_sessions = 2;
                c.session.ice_servers.push(IceServer::stun("stun:stun.example.org:3478"));
            })
            .await
            .unwrap();
        assert!(changes.try_recv().is_ok());

        let config = store.get();
        assert_eq!(config.session.max_sessions, 2);

        // Reopen and verify persistence
        let store2 = ConfigStore::new(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.session.max_sessions, 2);
        assert_eq!(config.session.ice_servers.len(), 1);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = ConfigStore::parse(
            r#"
            [session]
            bundle_policy = "max-bundle"

            [[session.ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "user"
            credential = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.bundle_policy, crate::config::BundlePolicy::MaxBundle);
        assert!(config.session.ice_servers[0].is_turn());
        assert_eq!(config.loopback, crate::config::LoopbackConfig::default());
    }

    #[test]
    fn test_invalid_value_rejected() {
        let err = ConfigStore::parse("[session]\nice_transport_policy = \"carrier-pigeon\"\n").unwrap_err();
        assert!(matches!(err, RtcError::Config(_)));
    }
}
