//! Artifact plumbing: before a step runs, materialize its input artifacts
//! on the host and wire bind mounts; after it exits, collect and upload its
//! declared outputs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Artifact, ArtifactKind, RunIds};
use crate::runtime::Bind;
use crate::store::{pack_dir, unpack_tar, ArtifactKey, ArtifactStore};

/// Host-side staging for one node: the binds to add to the launch and the
/// mapping from container paths back to host paths.
#[derive(Debug, Default)]
pub struct StagedNode {
    staging_dir: Option<PathBuf>,
    pub binds: Vec<Bind>,
    /// Container path (file or directory root) to host path, longest
    /// container path first.
    path_map: Vec<(String, PathBuf)>,
}

impl StagedNode {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Host path corresponding to an in-container path, through the staged
    /// mounts.
    pub fn resolve(&self, container_path: &str) -> Option<PathBuf> {
        for (mapped, host) in &self.path_map {
            if container_path == mapped {
                return Some(host.clone());
            }
            if let Some(rest) = container_path.strip_prefix(mapped) {
                if let Some(rest) = rest.strip_prefix('/') {
                    return Some(host.join(rest));
                }
            }
        }
        None
    }

    fn add_mapping(&mut self, container: impl Into<String>, host: PathBuf) {
        self.path_map.push((container.into(), host));
        self.path_map.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Best-effort removal of the staging directory.
    pub async fn cleanup(&self) {
        if let Some(dir) = &self.staging_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dir.display(), error = %e, "failed to remove staging dir");
                }
            }
        }
    }
}

/// Materialize input artifacts and prepare output mounts for one node.
///
/// `inputs` pairs each declared input with its resolved producer step; a
/// `None` producer is only valid for optional inputs.
pub async fn stage(
    store: Option<&dyn ArtifactStore>,
    ids: &RunIds,
    node_name: &str,
    inputs: &[(Artifact, Option<String>)],
    outputs: &[Artifact],
    staging_base: &Path,
) -> Result<StagedNode> {
    if inputs.is_empty() && outputs.is_empty() {
        return Ok(StagedNode::empty());
    }

    let store = store.ok_or_else(|| {
        Error::Artifact(format!(
            "node '{node_name}' declares artifacts but no store is configured"
        ))
    })?;

    let staging_dir = staging_base.join(&ids.run_id).join(node_name);
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .map_err(|e| Error::Artifact(format!("creating staging dir: {e}")))?;

    let mut staged = StagedNode {
        staging_dir: Some(staging_dir.clone()),
        ..StagedNode::default()
    };

    stage_inputs(store, ids, node_name, inputs, &staging_dir, &mut staged).await?;
    stage_output_mounts(node_name, outputs, &staging_dir, &mut staged).await?;

    Ok(staged)
}

async fn stage_inputs(
    store: &dyn ArtifactStore,
    ids: &RunIds,
    node_name: &str,
    inputs: &[(Artifact, Option<String>)],
    staging_dir: &Path,
    staged: &mut StagedNode,
) -> Result<()> {
    let inputs_dir = staging_dir.join("inputs");

    for (artifact, producer) in inputs {
        let Some(producer) = producer else {
            debug!(node = node_name, artifact = %artifact.name, "optional input has no producer, skipping");
            continue;
        };

        let key = ArtifactKey::for_run(ids, producer.clone(), artifact.name.clone())?;

        if !store.exists(&key).await? {
            if artifact.optional {
                debug!(node = node_name, %key, "optional input missing from store, skipping");
                continue;
            }
            return Err(Error::Artifact(format!(
                "required input '{}' for node '{node_name}' is missing at key '{key}'",
                artifact.name
            )));
        }

        match artifact.kind {
            ArtifactKind::File | ArtifactKind::Archive => {
                let host = inputs_dir.join(&artifact.name);
                store.download(&key, &host).await?;
                staged.binds.push(Bind {
                    host: host.clone(),
                    container: artifact.path.clone(),
                    read_only: true,
                });
                staged.add_mapping(artifact.path.clone(), host);
            }
            ArtifactKind::Directory => {
                let tar_path = inputs_dir.join(format!(".{}.tar", artifact.name));
                store.download(&key, &tar_path).await?;
                let host = inputs_dir.join(&artifact.name);
                unpack_tar(&tar_path, &host)?;
                let _ = tokio::fs::remove_file(&tar_path).await;
                staged.binds.push(Bind {
                    host: host.clone(),
                    container: artifact.path.clone(),
                    read_only: true,
                });
                staged.add_mapping(artifact.path.clone(), host);
            }
        }

        debug!(node = node_name, artifact = %artifact.name, %key, "input staged");
    }

    Ok(())
}

/// Prepare writable host directories for the step's declared outputs.
///
/// Directory outputs mount straight over the declared path. File and
/// archive outputs mount a shared host directory over the declared path's
/// parent, so the container writes land on the host.
async fn stage_output_mounts(
    node_name: &str,
    outputs: &[Artifact],
    staging_dir: &Path,
    staged: &mut StagedNode,
) -> Result<()> {
    let outputs_dir = staging_dir.join("outputs");
    let mut parent_mounts: HashMap<String, PathBuf> = HashMap::new();

    for artifact in outputs {
        match artifact.kind {
            ArtifactKind::Directory => {
                let host = outputs_dir.join(&artifact.name);
                tokio::fs::create_dir_all(&host)
                    .await
                    .map_err(|e| Error::Artifact(format!("creating output mount: {e}")))?;
                staged.binds.push(Bind {
                    host: host.clone(),
                    container: artifact.path.clone(),
                    read_only: false,
                });
                staged.add_mapping(artifact.path.clone(), host);
            }
            ArtifactKind::File | ArtifactKind::Archive => {
                let parent = container_parent(&artifact.path).ok_or_else(|| {
                    Error::Artifact(format!(
                        "node '{node_name}': cannot stage output '{}' at '{}'",
                        artifact.name, artifact.path
                    ))
                })?;

                if !parent_mounts.contains_key(&parent) {
                    let host = outputs_dir.join(format!("out-{}", parent_mounts.len()));
                    tokio::fs::create_dir_all(&host)
                        .await
                        .map_err(|e| Error::Artifact(format!("creating output mount: {e}")))?;
                    staged.binds.push(Bind {
                        host: host.clone(),
                        container: parent.clone(),
                        read_only: false,
                    });
                    staged.add_mapping(parent.clone(), host.clone());
                    parent_mounts.insert(parent, host);
                }
            }
        }
    }

    Ok(())
}

/// Parent directory of an absolute container path; `None` for the root
/// itself or paths directly under `/` would mean binding over `/`, which is
/// refused.
fn container_parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return None;
    }
    Some(trimmed[..idx].to_string())
}

/// Upload the node's declared outputs after a successful exit.
///
/// Missing optional outputs are skipped silently; missing required outputs
/// fail the step even though the container already exited.
pub async fn collect_outputs(
    store: Option<&dyn ArtifactStore>,
    ids: &RunIds,
    node_name: &str,
    outputs: &[Artifact],
    staged: &StagedNode,
) -> Result<()> {
    if outputs.is_empty() {
        return Ok(());
    }

    let store = store.ok_or_else(|| {
        Error::Artifact(format!(
            "node '{node_name}' declares outputs but no store is configured"
        ))
    })?;

    for artifact in outputs {
        let key = ArtifactKey::for_run(ids, node_name, artifact.name.clone())?;

        let Some(host) = staged.resolve(&artifact.path) else {
            if artifact.optional {
                continue;
            }
            return Err(Error::Artifact(format!(
                "required output '{}' of node '{node_name}' has no staged mount",
                artifact.name
            )));
        };

        match artifact.kind {
            ArtifactKind::File | ArtifactKind::Archive => {
                if !host.is_file() {
                    if artifact.optional {
                        debug!(node = node_name, artifact = %artifact.name, "optional output missing");
                        continue;
                    }
                    return Err(Error::Artifact(format!(
                        "required output '{}' of node '{node_name}' was not produced at '{}'",
                        artifact.name, artifact.path
                    )));
                }
                store.upload(&key, &host).await?;
            }
            ArtifactKind::Directory => {
                if !host.is_dir() {
                    if artifact.optional {
                        continue;
                    }
                    return Err(Error::Artifact(format!(
                        "required output '{}' of node '{node_name}' was not produced at '{}'",
                        artifact.name, artifact.path
                    )));
                }
                let tar_path = staged
                    .staging_dir
                    .as_deref()
                    .unwrap_or_else(|| Path::new("."))
                    .join(format!(".{}.tar", artifact.name));
                pack_dir(&host, &tar_path)?;
                store.upload(&key, &tar_path).await?;
                let _ = tokio::fs::remove_file(&tar_path).await;
            }
        }

        debug!(node = node_name, artifact = %artifact.name, %key, "output uploaded");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;

    fn ids() -> RunIds {
        RunIds {
            workflow_id: "wf".into(),
            run_id: "r1".into(),
        }
    }

    fn artifact(name: &str, path: &str, kind: ArtifactKind) -> Artifact {
        Artifact {
            name: name.into(),
            path: path.into(),
            kind,
            optional: false,
            source_step: None,
        }
    }

    #[tokio::test]
    async fn no_artifacts_stages_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = stage(None, &ids(), "a", &[], &[], tmp.path()).await.unwrap();
        assert!(staged.binds.is_empty());
        assert!(staged.resolve("/anything").is_none());
    }

    #[tokio::test]
    async fn file_input_is_staged_and_bound() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("store"));

        let src = tmp.path().join("app");
        std::fs::write(&src, b"bytes").unwrap();
        let key = ArtifactKey::new("wf", "r1", "build", "binary").unwrap();
        store.upload(&key, &src).await.unwrap();

        let inputs = vec![(
            artifact("binary", "/app", ArtifactKind::File),
            Some("build".to_string()),
        )];
        let staged = stage(
            Some(&store),
            &ids(),
            "deploy",
            &inputs,
            &[],
            &tmp.path().join("staging"),
        )
        .await
        .unwrap();

        assert_eq!(staged.binds.len(), 1);
        assert_eq!(staged.binds[0].container, "/app");
        assert!(staged.binds[0].read_only);
        assert_eq!(std::fs::read(&staged.binds[0].host).unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn missing_required_input_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("store"));

        let inputs = vec![(
            artifact("binary", "/app", ArtifactKind::File),
            Some("build".to_string()),
        )];
        let err = stage(
            Some(&store),
            &ids(),
            "deploy",
            &inputs,
            &[],
            &tmp.path().join("staging"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Artifact(_)));
    }

    #[tokio::test]
    async fn missing_optional_input_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("store"));

        let mut optional = artifact("cache", "/cache", ArtifactKind::File);
        optional.optional = true;
        let inputs = vec![(optional, Some("build".to_string()))];

        let staged = stage(
            Some(&store),
            &ids(),
            "deploy",
            &inputs,
            &[],
            &tmp.path().join("staging"),
        )
        .await
        .unwrap();
        assert!(staged.binds.is_empty());
    }

    #[tokio::test]
    async fn file_output_mount_and_collect_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("store"));

        let outputs = vec![artifact("binary", "/out/app", ArtifactKind::File)];
        let staged = stage(
            Some(&store),
            &ids(),
            "build",
            &[],
            &outputs,
            &tmp.path().join("staging"),
        )
        .await
        .unwrap();

        // The parent directory /out is bound to a host dir.
        assert_eq!(staged.binds.len(), 1);
        assert_eq!(staged.binds[0].container, "/out");
        assert!(!staged.binds[0].read_only);

        // Simulate the container writing /out/app.
        let host_file = staged.resolve("/out/app").unwrap();
        std::fs::write(&host_file, b"built").unwrap();

        collect_outputs(Some(&store), &ids(), "build", &outputs, &staged)
            .await
            .unwrap();

        let key = ArtifactKey::new("wf", "r1", "build", "binary").unwrap();
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn sibling_file_outputs_share_one_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("store"));

        let outputs = vec![
            artifact("app", "/out/app", ArtifactKind::File),
            artifact("map", "/out/app.map", ArtifactKind::File),
        ];
        let staged = stage(
            Some(&store),
            &ids(),
            "build",
            &[],
            &outputs,
            &tmp.path().join("staging"),
        )
        .await
        .unwrap();
        assert_eq!(staged.binds.len(), 1);
    }

    #[tokio::test]
    async fn directory_output_is_archived_on_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("store"));

        let outputs = vec![artifact("dist", "/dist", ArtifactKind::Directory)];
        let staged = stage(
            Some(&store),
            &ids(),
            "build",
            &[],
            &outputs,
            &tmp.path().join("staging"),
        )
        .await
        .unwrap();

        let host_dir = staged.resolve("/dist").unwrap();
        std::fs::write(host_dir.join("index.html"), b"<html>").unwrap();

        collect_outputs(Some(&store), &ids(), "build", &outputs, &staged)
            .await
            .unwrap();

        // Round-trip: download and unpack reproduces the tree.
        let key = ArtifactKey::new("wf", "r1", "build", "dist").unwrap();
        let fetched_tar = tmp.path().join("dist.tar");
        store.download(&key, &fetched_tar).await.unwrap();
        let restored = tmp.path().join("restored");
        unpack_tar(&fetched_tar, &restored).unwrap();
        assert_eq!(std::fs::read(restored.join("index.html")).unwrap(), b"<html>");
    }

    #[tokio::test]
    async fn missing_required_output_fails_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path().join("store"));

        let outputs = vec![artifact("binary", "/out/app", ArtifactKind::File)];
        let staged = stage(
            Some(&store),
            &ids(),
            "build",
            &[],
            &outputs,
            &tmp.path().join("staging"),
        )
        .await
        .unwrap();

        let err = collect_outputs(Some(&store), &ids(), "build", &outputs, &staged)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("was not produced"));
    }

    #[test]
    fn container_parent_rules() {
        assert_eq!(container_parent("/out/app"), Some("/out".to_string()));
        assert_eq!(container_parent("/a/b/c"), Some("/a/b".to_string()));
        assert_eq!(container_parent("/app"), None);
        assert_eq!(container_parent("/"), None);
    }
}
