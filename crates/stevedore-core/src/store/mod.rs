//! Artifact store: content transfer between steps, keyed by
//! `workflow/run/step/name`.

mod archive;
mod local;
mod retention;
mod s3;

pub use archive::{pack_dir, unpack_tar};
pub use local::LocalStore;
pub use retention::purge_expired;
pub use s3::{S3Config, S3Store};

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::RunIds;

/// Fully-qualified location of one artifact.
///
/// Rendered as `workflow_id/run_id/step_name/artifact_name`; the same string
/// is the S3 object key and the local store's relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub workflow_id: String,
    pub run_id: String,
    pub step: String,
    pub name: String,
}

impl ArtifactKey {
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        step: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            step: step.into(),
            name: name.into(),
        };
        for segment in [&key.workflow_id, &key.run_id, &key.step, &key.name] {
            if segment.is_empty() || segment.contains('/') {
                return Err(Error::Validation(format!(
                    "invalid artifact key segment '{segment}'"
                )));
            }
        }
        Ok(key)
    }

    pub fn for_run(ids: &RunIds, step: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Self::new(ids.workflow_id.clone(), ids.run_id.clone(), step, name)
    }

    /// Parse a rendered `w/r/s/n` key.
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(w), Some(r), Some(s), Some(n), None) => Self::new(w, r, s, n),
            _ => Err(Error::Validation(format!("malformed artifact key '{key}'"))),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.workflow_id, self.run_id, self.step, self.name
        )
    }
}

/// Prefix covering every artifact of one run.
pub fn run_prefix(ids: &RunIds) -> String {
    format!("{}/{}", ids.workflow_id, ids.run_id)
}

/// What `list` reports per stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Uniform store boundary; local filesystem and S3 implement it.
///
/// Uploads are atomic-or-absent: a failed upload leaves the key missing,
/// never partial. Deleting a missing key succeeds. Listing a missing prefix
/// returns an empty vector.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, key: &ArtifactKey, src: &Path) -> Result<()>;

    /// Fails with [`Error::Artifact`] when the key does not exist.
    async fn download(&self, key: &ArtifactKey, dest: &Path) -> Result<()>;

    async fn delete(&self, key: &ArtifactKey) -> Result<()>;

    async fn exists(&self, key: &ArtifactKey) -> Result<bool>;

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMetadata>>;

    /// Remove everything under a prefix, returning the number of objects
    /// deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut removed = 0;
        for meta in self.list(prefix).await? {
            let key = ArtifactKey::parse(&meta.key)?;
            self.delete(&key).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Release any held resources. Default is a no-op.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
