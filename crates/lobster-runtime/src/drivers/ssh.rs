use std::fs;
use std::path::PathBuf;

use tracing::info;

use crate::shell::{self, ExecOpts};
use lobster_core::config::state_dir;
use lobster_core::error::{Error, Result};

/// Directory holding per-tenant operator keypairs.
pub fn key_dir() -> PathBuf {
    match std::env::var("LOBSTERD_SSH_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => state_dir().join("ssh"),
    }
}

pub fn private_key_path(name: &str) -> PathBuf {
    key_dir().join(name)
}

pub fn public_key_path(name: &str) -> PathBuf {
    key_dir().join(format!("{}.pub", name))
}

/// Generate an ed25519 keypair for a tenant and return the public key.
/// Fails if a key for the name already exists.
pub async fn generate_keypair(name: &str) -> Result<String> {
    let priv_path = private_key_path(name);
    if priv_path.exists() {
        return Err(Error::ValidationFailed(format!(
            "ssh key already exists for {:?}",
            name
        )));
    }
    fs::create_dir_all(key_dir())?;
    let comment = format!("lobsterd-{}", name);
    shell::exec(
        &[
            "ssh-keygen",
            "-q",
            "-t",
            "ed25519",
            "-N",
            "",
            "-C",
            &comment,
            "-f",
            &priv_path.to_string_lossy(),
        ],
        &ExecOpts::default(),
    )
    .await?;
    let public = fs::read_to_string(public_key_path(name))?;
    info!(tenant = name, "ssh keypair generated");
    Ok(public.trim().to_string())
}

/// Remove a tenant's keypair. Missing files are success.
pub fn remove_keypair(name: &str) -> Result<()> {
    for path in [private_key_path(name), public_key_path(name)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
