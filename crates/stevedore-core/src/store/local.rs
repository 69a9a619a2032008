use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{ArtifactKey, ArtifactMetadata, ArtifactStore};
use crate::error::{Error, Result};

/// Filesystem-backed store: key `w/r/s/n` lives at `<base>/w/r/s/n`.
///
/// Uploads write to a sibling temp file and rename into place, so a key is
/// either fully present or absent.
#[derive(Debug, Clone)]
pub struct LocalStore {
    base: PathBuf,
}

impl LocalStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.base
            .join(&key.workflow_id)
            .join(&key.run_id)
            .join(&key.step)
            .join(&key.name)
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn upload(&self, key: &ArtifactKey, src: &Path) -> Result<()> {
        let dest = self.path_for(key);
        let parent = dest
            .parent()
            .ok_or_else(|| Error::Internal(format!("key path '{}' has no parent", dest.display())))?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Artifact(format!("creating '{}': {e}", parent.display())))?;

        let tmp = parent.join(format!(".upload-{}", Uuid::new_v4()));
        if let Err(e) = tokio::fs::copy(src, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Artifact(format!(
                "staging upload for '{key}': {e}"
            )));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Artifact(format!("publishing '{key}': {e}")));
        }

        debug!(%key, dest = %dest.display(), "artifact uploaded");
        Ok(())
    }

    async fn download(&self, key: &ArtifactKey, dest: &Path) -> Result<()> {
        let src = self.path_for(key);
        if !tokio::fs::try_exists(&src)
            .await
            .map_err(|e| Error::Artifact(format!("probing '{key}': {e}")))?
        {
            return Err(Error::Artifact(format!("artifact '{key}' not found")));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Artifact(format!("creating '{}': {e}", parent.display())))?;
        }

        tokio::fs::copy(&src, dest)
            .await
            .map_err(|e| Error::Artifact(format!("downloading '{key}': {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Artifact(format!("deleting '{key}': {e}"))),
        }
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .map_err(|e| Error::Artifact(format!("probing '{key}': {e}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMetadata>> {
        let mut entries = Vec::new();
        collect_files(&self.base, &self.base, &mut entries)?;

        let mut results = Vec::new();
        for path in entries {
            let relative = path
                .strip_prefix(&self.base)
                .map_err(|e| Error::Internal(format!("path outside store base: {e}")))?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if !key.starts_with(prefix) {
                continue;
            }

            let meta = std::fs::metadata(&path)
                .map_err(|e| Error::Artifact(format!("stat '{}': {e}", path.display())))?;
            let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
            results.push(ArtifactMetadata {
                key,
                size: meta.len(),
                modified,
            });
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::Artifact(format!(
                "listing '{}': {e}",
                dir.display()
            )))
        }
    };

    for entry in entries {
        let entry =
            entry.map_err(|e| Error::Artifact(format!("listing '{}': {e}", dir.display())))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else if path
            .file_name()
            .is_some_and(|n| !n.to_string_lossy().starts_with(".upload-"))
        {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(step: &str, name: &str) -> ArtifactKey {
        ArtifactKey::new("wf", "run1", step, name).unwrap()
    }

    #[tokio::test]
    async fn upload_download_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("store"));

        let src = tmp.path().join("app");
        std::fs::write(&src, b"binary bytes").unwrap();

        let k = key("build", "binary");
        store.upload(&k, &src).await.unwrap();
        assert!(store.exists(&k).await.unwrap());

        let dest = tmp.path().join("fetched/app");
        store.download(&k, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"binary bytes");
    }

    #[tokio::test]
    async fn layout_matches_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());

        let src = tmp.path().join("f");
        std::fs::write(&src, b"x").unwrap();
        store.upload(&key("step", "name"), &src).await.unwrap();

        assert!(tmp.path().join("wf/run1/step/name").is_file());
    }

    #[tokio::test]
    async fn download_missing_key_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        let err = store
            .download(&key("build", "ghost"), &tmp.path().join("dest"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        store.delete(&key("build", "ghost")).await.unwrap();

        let src = tmp.path().join("f");
        std::fs::write(&src, b"x").unwrap();
        let k = key("build", "binary");
        store.upload(&k, &src).await.unwrap();
        store.delete(&k).await.unwrap();
        store.delete(&k).await.unwrap();
        assert!(!store.exists(&k).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("s"));

        let src = tmp.path().join("f");
        std::fs::write(&src, b"data").unwrap();

        store.upload(&key("build", "a"), &src).await.unwrap();
        store.upload(&key("build", "b"), &src).await.unwrap();
        store.upload(&key("test", "report"), &src).await.unwrap();

        let listed = store.list("wf/run1/build").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, "wf/run1/build/a");
        assert_eq!(listed[0].size, 4);

        let all = store.list("wf/run1").await.unwrap();
        assert_eq!(all.len(), 3);

        let none = store.list("wf/other-run").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn delete_prefix_removes_run() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("s"));

        let src = tmp.path().join("f");
        std::fs::write(&src, b"data").unwrap();
        store.upload(&key("build", "a"), &src).await.unwrap();
        store.upload(&key("test", "b"), &src).await.unwrap();

        let removed = store.delete_prefix("wf/run1").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.list("wf/run1").await.unwrap().is_empty());
    }
}
