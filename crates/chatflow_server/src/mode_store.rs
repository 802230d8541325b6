use anyhow::Context as _;
use chatflow_domain::PersistedModes;
use std::path::PathBuf;

/// JSON file holding the global toggles. Without a path nothing is stored.
#[derive(Clone, Debug, Default)]
pub struct ModeStore {
    path: Option<PathBuf>,
}

impl ModeStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub async fn load(&self) -> anyhow::Result<PersistedModes> {
        let Some(path) = &self.path else {
            return Ok(PersistedModes::default());
        };
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedModes::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub async fn save(&self, modes: &PersistedModes) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_vec_pretty(modes).context("failed to encode modes")?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModeStore::new(Some(dir.path().join("modes.json")));
        assert_eq!(store.load().await.expect("load"), PersistedModes::default());
    }

    #[tokio::test]
    async fn saved_modes_are_restored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModeStore::new(Some(dir.path().join("nested").join("modes.json")));
        let modes = PersistedModes {
            workflow_enabled: Some(true),
            relay_enabled: Some(false),
        };
        store.save(&modes).await.expect("save");
        assert_eq!(store.load().await.expect("load"), modes);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("modes.json");
        tokio::fs::write(&path, b"{not json").await.expect("write");
        assert!(ModeStore::new(Some(path)).load().await.is_err());
    }

    #[tokio::test]
    async fn store_without_path_is_a_no_op() {
        let store = ModeStore::default();
        store
            .save(&PersistedModes {
                workflow_enabled: Some(true),
                relay_enabled: None,
            })
            .await
            .expect("save");
        assert_eq!(store.load().await.expect("load"), PersistedModes::default());
    }
}
