use std::path::Path;

use tracing::{debug, info};

use crate::shell::{self, ExecOpts};
use lobster_core::error::{Error, Result};

/// Firewall chain owning all tenant egress rules.
pub const CHAIN: &str = "LOBSTER";

fn net_err(e: Error) -> Error {
    match e {
        Error::ExecFailed { stderr, .. } => Error::NetworkSetupFailed(stderr),
        other => other,
    }
}

fn fw_err(e: Error) -> Error {
    match e {
        Error::ExecFailed { stderr, .. } => Error::FirewallError(stderr),
        other => other,
    }
}

/// Whether a network interface exists.
pub async fn tap_exists(name: &str) -> Result<bool> {
    Ok(Path::new("/sys/class/net").join(name).exists())
}

/// Create a TAP device owned by the tenant's uid and bring it up.
/// Fails if the device already exists.
pub async fn create_tap(name: &str, uid: u32) -> Result<()> {
    let uid_s = uid.to_string();
    shell::exec(
        &[
            "ip", "tuntap", "add", "dev", name, "mode", "tap", "user", &uid_s,
        ],
        &ExecOpts::default(),
    )
    .await
    .map_err(net_err)?;
    shell::exec(&["ip", "link", "set", name, "up"], &ExecOpts::default())
        .await
        .map_err(net_err)?;
    info!(tap = name, uid, "tap created");
    Ok(())
}

/// Delete a TAP device. Deleting a missing device is success.
pub async fn delete_tap(name: &str) -> Result<()> {
    if !tap_exists(name).await? {
        return Ok(());
    }
    shell::exec(&["ip", "link", "del", name], &ExecOpts::default())
        .await
        .map_err(net_err)?;
    info!(tap = name, "tap deleted");
    Ok(())
}

/// Assign the host side of the tenant's /30 to the TAP device.
/// `replace` semantics keep re-runs idempotent for the reconciler.
pub async fn assign_address(name: &str, host_ip: &str) -> Result<()> {
    let cidr = format!("{}/30", host_ip);
    shell::exec(
        &["ip", "addr", "replace", &cidr, "dev", name],
        &ExecOpts::default(),
    )
    .await
    .map_err(net_err)?;
    Ok(())
}

/// First IPv4 address currently assigned to an interface, if any.
pub async fn tap_address(name: &str) -> Result<Option<String>> {
    let out = shell::exec_unchecked(&["ip", "-4", "addr", "show", name], &ExecOpts::default())
        .await
        .map_err(net_err)?;
    if !out.success() {
        return Ok(None);
    }
    for line in out.stdout.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("inet ") {
            if let Some(addr) = rest.split_whitespace().next() {
                return Ok(addr.split('/').next().map(|s| s.to_string()));
            }
        }
    }
    Ok(None)
}

/// Enable IPv4 forwarding host-wide.
pub async fn enable_ip_forwarding() -> Result<()> {
    shell::exec(
        &["sysctl", "-w", "net.ipv4.ip_forward=1"],
        &ExecOpts::default(),
    )
    .await
    .map_err(net_err)?;
    Ok(())
}

/// Ensure the tenant firewall chain exists and is jumped to from OUTPUT.
///
/// The chain holds owner-match rules: the proxy uid bypass must sit at
/// the head, tenant DROP rules are appended after it.
pub async fn ensure_chain() -> Result<()> {
    let exists = shell::exec_unchecked(&["iptables", "-n", "-L", CHAIN], &ExecOpts::default())
        .await
        .map_err(fw_err)?;
    if !exists.success() {
        shell::exec(&["iptables", "-N", CHAIN], &ExecOpts::default())
            .await
            .map_err(fw_err)?;
    }
    let jump = shell::exec_unchecked(
        &["iptables", "-C", "OUTPUT", "-j", CHAIN],
        &ExecOpts::default(),
    )
    .await
    .map_err(fw_err)?;
    if !jump.success() {
        shell::exec(
            &["iptables", "-I", "OUTPUT", "1", "-j", CHAIN],
            &ExecOpts::default(),
        )
        .await
        .map_err(fw_err)?;
    }
    debug!(chain = CHAIN, "firewall chain ensured");
    Ok(())
}

/// Insert the proxy-uid bypass at the head of the chain so it precedes
/// every tenant DROP rule.
pub async fn add_uid_bypass(uid: u32) -> Result<()> {
    let uid_s = uid.to_string();
    let present = shell::exec_unchecked(
        &[
            "iptables", "-C", CHAIN, "-m", "owner", "--uid-owner", &uid_s, "-j", "RETURN",
        ],
        &ExecOpts::default(),
    )
    .await
    .map_err(fw_err)?;
    if present.success() {
        return Ok(());
    }
    shell::exec(
        &[
            "iptables", "-I", CHAIN, "1", "-m", "owner", "--uid-owner", &uid_s, "-j", "RETURN",
        ],
        &ExecOpts::default(),
    )
    .await
    .map_err(fw_err)?;
    Ok(())
}

/// Whether the egress DROP for a tenant uid is installed.
pub async fn tenant_drop_present(uid: u32) -> Result<bool> {
    let uid_s = uid.to_string();
    let out = shell::exec_unchecked(
        &[
            "iptables", "-C", CHAIN, "-m", "owner", "--uid-owner", &uid_s, "-j", "DROP",
        ],
        &ExecOpts::default(),
    )
    .await
    .map_err(fw_err)?;
    Ok(out.success())
}

/// Append the egress DROP for a tenant uid (idempotent).
pub async fn add_tenant_drop(uid: u32) -> Result<()> {
    if tenant_drop_present(uid).await? {
        return Ok(());
    }
    let uid_s = uid.to_string();
    shell::exec(
        &[
            "iptables", "-A", CHAIN, "-m", "owner", "--uid-owner", &uid_s, "-j", "DROP",
        ],
        &ExecOpts::default(),
    )
    .await
    .map_err(fw_err)?;
    info!(uid, "tenant egress drop installed");
    Ok(())
}

/// Remove the egress DROP for a tenant uid. Missing rule is success.
pub async fn remove_tenant_drop(uid: u32) -> Result<()> {
    if !tenant_drop_present(uid).await? {
        return Ok(());
    }
    let uid_s = uid.to_string();
    shell::exec(
        &[
            "iptables", "-D", CHAIN, "-m", "owner", "--uid-owner", &uid_s, "-j", "DROP",
        ],
        &ExecOpts::default(),
    )
    .await
    .map_err(fw_err)?;
    Ok(())
}

/// Current rx_bytes of an interface, from sysfs.
pub fn rx_bytes(name: &str) -> Result<u64> {
    let path = format!("/sys/class/net/{}/statistics/rx_bytes", name);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| Error::NetworkSetupFailed(format!("read {}: {}", path, e)))?;
    raw.trim()
        .parse()
        .map_err(|e| Error::NetworkSetupFailed(format!("parse {}: {}", path, e)))
}

/// Interfaces whose name starts with the given prefix (orphan sweep).
pub fn list_taps(prefix: &str) -> Result<Vec<String>> {
    let mut taps = Vec::new();
    for entry in std::fs::read_dir("/sys/class/net")? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) {
            taps.push(name);
        }
    }
    taps.sort();
    Ok(taps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_err_wraps_stderr() {
        let err = net_err(Error::ExecFailed {
            argv: vec!["ip".to_string()],
            exit_code: Some(2),
            signal: None,
            stderr: "RTNETLINK answers: File exists".to_string(),
        });
        assert!(matches!(err, Error::NetworkSetupFailed(_)));
    }

    #[test]
    fn test_fw_err_wraps_stderr() {
        let err = fw_err(Error::ExecFailed {
            argv: vec!["iptables".to_string()],
            exit_code: Some(1),
            signal: None,
            stderr: "No chain/target/match by that name".to_string(),
        });
        assert!(matches!(err, Error::FirewallError(_)));
    }

    #[tokio::test]
    async fn test_tap_exists_loopback() {
        // Every Linux host has lo; arbitrary names do not exist.
        assert!(tap_exists("lo").await.unwrap());
        assert!(!tap_exists("tap-no-such-dev").await.unwrap());
    }

    #[test]
    fn test_rx_bytes_loopback_parses() {
        let n = rx_bytes("lo").unwrap();
        // Counter is a valid number (could be zero on a fresh netns).
        assert!(n < u64::MAX);
    }

    #[test]
    fn test_rx_bytes_missing_dev() {
        assert!(rx_bytes("tap-no-such-dev").is_err());
    }
}
