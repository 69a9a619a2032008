use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Remove run directories older than the retention window from a local
/// store base.
///
/// Layout is `<base>/<workflow_id>/<run_id>/...`; a run's age is taken from
/// its directory modification time. `retention_days == 0` means keep
/// forever. Returns the number of runs removed.
pub fn purge_expired(base: &Path, retention_days: u64) -> Result<u64> {
    if retention_days == 0 {
        return Ok(0);
    }
    if !base.exists() {
        debug!(path = %base.display(), "no store base found, nothing to purge");
        return Ok(0);
    }

    let cutoff = std::time::Duration::from_secs(retention_days * 24 * 60 * 60);
    let now = SystemTime::now();
    let mut removed: u64 = 0;

    let workflows = std::fs::read_dir(base)
        .map_err(|e| Error::Artifact(format!("reading store base: {e}")))?;

    for workflow in workflows {
        let workflow =
            workflow.map_err(|e| Error::Artifact(format!("reading store base entry: {e}")))?;
        let workflow_dir = workflow.path();
        if !workflow_dir.is_dir() {
            continue;
        }

        let runs = std::fs::read_dir(&workflow_dir)
            .map_err(|e| Error::Artifact(format!("reading '{}': {e}", workflow_dir.display())))?;

        for run in runs {
            let run = run
                .map_err(|e| Error::Artifact(format!("reading '{}': {e}", workflow_dir.display())))?;
            let run_dir = run.path();
            if !run_dir.is_dir() {
                continue;
            }

            let modified = match std::fs::metadata(&run_dir).and_then(|m| m.modified()) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(path = %run_dir.display(), error = %e, "skipping run with unreadable mtime");
                    continue;
                }
            };

            let age = now.duration_since(modified).unwrap_or_default();
            if age > cutoff {
                info!(path = %run_dir.display(), age_days = age.as_secs() / 86_400, "removing expired run artifacts");
                std::fs::remove_dir_all(&run_dir).map_err(|e| {
                    Error::Artifact(format!("removing '{}': {e}", run_dir.display()))
                })?;
                removed += 1;
            }
        }

        // Drop workflow directories that just became empty.
        if std::fs::read_dir(&workflow_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false)
        {
            let _ = std::fs::remove_dir(&workflow_dir);
        }
    }

    info!(removed, "retention purge complete");
    Ok(removed)
}
