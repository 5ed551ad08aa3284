use std::time::Duration;

use tracing::info;

use crate::shell::{self, ExecOpts};
use lobster_core::error::{Error, Result};

/// ZFS operations can stall on busy pools; give them more room than the
/// default exec budget.
fn opts() -> ExecOpts {
    ExecOpts::with_timeout(Duration::from_secs(60))
}

fn zfs_err(e: Error) -> Error {
    match e {
        Error::ExecFailed { stderr, .. } => Error::ZfsError(stderr),
        other => other,
    }
}

/// Whether a dataset exists.
pub async fn dataset_exists(dataset: &str) -> Result<bool> {
    let out = shell::exec_unchecked(&["zfs", "list", "-H", "-o", "name", dataset], &opts())
        .await
        .map_err(zfs_err)?;
    Ok(out.success())
}

/// Create a dataset with quota, compression, and an explicit mountpoint.
/// Fails if the dataset already exists.
pub async fn create_dataset(
    dataset: &str,
    mountpoint: &str,
    quota: &str,
    compression: &str,
) -> Result<()> {
    let quota_opt = format!("quota={}", quota);
    let compression_opt = format!("compression={}", compression);
    let mountpoint_opt = format!("mountpoint={}", mountpoint);
    shell::exec(
        &[
            "zfs",
            "create",
            "-o",
            &quota_opt,
            "-o",
            &compression_opt,
            "-o",
            &mountpoint_opt,
            dataset,
        ],
        &opts(),
    )
    .await
    .map_err(zfs_err)?;
    info!(dataset, mountpoint, quota, "dataset created");
    Ok(())
}

/// Destroy a dataset and everything under it. Destroying a dataset that
/// is already gone is success.
pub async fn destroy_dataset(dataset: &str) -> Result<()> {
    if !dataset_exists(dataset).await? {
        return Ok(());
    }
    shell::exec(&["zfs", "destroy", "-r", dataset], &opts())
        .await
        .map_err(zfs_err)?;
    info!(dataset, "dataset destroyed");
    Ok(())
}

/// Snapshot a dataset under the given tag. Returns the full snapshot name.
pub async fn snapshot(dataset: &str, tag: &str) -> Result<String> {
    let snap = format!("{}@{}", dataset, tag);
    shell::exec(&["zfs", "snapshot", &snap], &opts())
        .await
        .map_err(zfs_err)?;
    info!(snapshot = %snap, "snapshot created");
    Ok(snap)
}

/// List snapshots of a dataset, oldest first.
pub async fn list_snapshots(dataset: &str) -> Result<Vec<String>> {
    let out = shell::exec(
        &[
            "zfs", "list", "-H", "-t", "snapshot", "-o", "name", "-s", "creation", "-d", "1",
            dataset,
        ],
        &opts(),
    )
    .await
    .map_err(zfs_err)?;
    Ok(out
        .stdout
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Destroy all but the newest `keep` snapshots, oldest first.
/// Returns the names destroyed.
pub async fn prune_snapshots(dataset: &str, keep: usize) -> Result<Vec<String>> {
    let snaps = list_snapshots(dataset).await?;
    if snaps.len() <= keep {
        return Ok(Vec::new());
    }
    let doomed: Vec<String> = snaps[..snaps.len() - keep].to_vec();
    for snap in &doomed {
        shell::exec(&["zfs", "destroy", snap], &opts())
            .await
            .map_err(zfs_err)?;
    }
    info!(dataset, pruned = doomed.len(), "snapshots pruned");
    Ok(doomed)
}

/// Direct children of a parent dataset (for orphan collection).
pub async fn list_children(parent: &str) -> Result<Vec<String>> {
    let out = shell::exec_unchecked(
        &["zfs", "list", "-H", "-o", "name", "-r", "-d", "1", parent],
        &opts(),
    )
    .await
    .map_err(zfs_err)?;
    if !out.success() {
        // Parent itself missing: nothing to list.
        return Ok(Vec::new());
    }
    Ok(out
        .stdout
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && l != parent)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zfs_err_extracts_stderr() {
        let err = zfs_err(Error::ExecFailed {
            argv: vec!["zfs".to_string()],
            exit_code: Some(1),
            signal: None,
            stderr: "cannot create 'tank/x': dataset already exists".to_string(),
        });
        match err {
            Error::ZfsError(msg) => assert!(msg.contains("already exists")),
            other => panic!("expected ZfsError, got {:?}", other),
        }
    }

    #[test]
    fn test_zfs_err_passes_other_errors() {
        let err = zfs_err(Error::RegistryLocked);
        assert!(matches!(err, Error::RegistryLocked));
    }
}
