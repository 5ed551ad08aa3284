use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::shell::{self, ExecOpts};
use lobster_core::config::LobsterdConfig;
use lobster_core::error::{Error, Result};
use lobster_core::naming;
use lobster_core::tenant::Tenant;

/// Guest resources for every tenant VM.
const VCPUS: u32 = 2;
const MEM_MIB: u32 = 1024;
/// Size of the writable overlay image created per tenant.
const OVERLAY_MIB: u32 = 1024;

/// How long to wait for the jailed Firecracker to create its API socket.
const API_SOCK_WAIT: Duration = Duration::from_secs(10);

/// Jailer chroot directory for a VM: `<base>/firecracker/<vm_id>`.
///
/// The `firecracker` path segment is the jailer's convention (basename
/// of the exec file).
pub fn chroot_dir(chroot_base: &str, vm_id: &str) -> PathBuf {
    Path::new(chroot_base).join("firecracker").join(vm_id)
}

/// Root of the chroot, where kernel/rootfs/overlay/sockets live.
pub fn chroot_root(chroot_base: &str, vm_id: &str) -> PathBuf {
    chroot_dir(chroot_base, vm_id).join("root")
}

/// Host path of the Firecracker vsock UDS for a tenant.
pub fn vsock_uds_path(chroot_base: &str, vm_id: &str) -> PathBuf {
    chroot_root(chroot_base, vm_id).join("v.sock")
}

/// Per-tenant writable overlay image path.
pub fn overlay_path(name: &str) -> PathBuf {
    lobster_core::config::state_dir()
        .join("overlays")
        .join(format!("{}.ext4", name))
}

fn jail_err(e: Error) -> Error {
    match e {
        Error::ExecFailed { stderr, .. } => Error::JailerSetupFailed(stderr),
        other => other,
    }
}

/// Hard-link src into the chroot, falling back to a copy across
/// filesystems.
fn link_into(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_file(dst)?;
    }
    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst)?;
    }
    Ok(())
}

/// Create the tenant's writable overlay if missing: sparse file + ext4.
pub async fn ensure_overlay(name: &str) -> Result<PathBuf> {
    let path = overlay_path(name);
    if path.exists() {
        return Ok(path);
    }
    let path_s = path.to_string_lossy().to_string();
    let of = format!("of={}", path_s);
    let seek = format!("seek={}", OVERLAY_MIB);
    shell::exec(
        &["dd", "if=/dev/null", &of, "bs=1M", "count=0", &seek],
        &ExecOpts::default(),
    )
    .await
    .map_err(jail_err)?;
    shell::exec(
        &["mkfs.ext4", "-q", "-F", &path_s],
        &ExecOpts::with_timeout(Duration::from_secs(60)),
    )
    .await
    .map_err(jail_err)?;
    info!(overlay = %path_s, "overlay image created");
    Ok(path)
}

/// Lay out the jailer chroot: hard-link kernel, rootfs, and the writable
/// overlay, render the machine config, and hand the tree to the tenant
/// uid. Re-running over an existing chroot refreshes the links, which is
/// what resume and repair want. Device nodes are the jailer's job.
pub async fn prepare_chroot(config: &LobsterdConfig, tenant: &Tenant) -> Result<()> {
    let root = chroot_root(&config.jailer.chroot_base_dir, &tenant.vm_id);
    fs::create_dir_all(&root)?;

    // Artifact links first: missing kernel/rootfs should fail before an
    // overlay image gets built.
    link_into(Path::new(&config.firecracker.kernel_path), &root.join("vmlinux"))?;
    link_into(Path::new(&config.firecracker.rootfs_path), &root.join("rootfs.ext4"))?;
    let overlay = ensure_overlay(&tenant.name).await?;
    link_into(&overlay, &root.join("overlay.ext4"))?;

    let fc_json = render_machine_config(config, tenant)?;
    fs::write(root.join("fc.json"), fc_json)?;

    // The jailed process runs as the tenant uid and must own its tree.
    let uid_pair = format!("{}:{}", tenant.uid, tenant.uid);
    let dir = chroot_dir(&config.jailer.chroot_base_dir, &tenant.vm_id);
    shell::exec(
        &["chown", "-R", &uid_pair, &dir.to_string_lossy()],
        &ExecOpts::default(),
    )
    .await
    .map_err(jail_err)?;

    debug!(vm_id = %tenant.vm_id, root = %root.display(), "chroot prepared");
    Ok(())
}

/// Whether the chroot tree for a VM is present.
pub fn chroot_exists(chroot_base: &str, vm_id: &str) -> bool {
    chroot_root(chroot_base, vm_id).join("vmlinux").exists()
}

/// Remove a VM's chroot tree. Missing tree is success.
pub async fn cleanup_chroot(chroot_base: &str, vm_id: &str) -> Result<()> {
    let dir = chroot_dir(chroot_base, vm_id);
    if !dir.exists() {
        return Ok(());
    }
    fs::remove_dir_all(&dir)?;
    info!(vm_id, "chroot removed");
    Ok(())
}

/// Jailer chroot ids currently on disk (orphan sweep).
pub fn list_chroots(chroot_base: &str) -> Result<Vec<String>> {
    let dir = Path::new(chroot_base).join("firecracker");
    let mut ids = Vec::new();
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        ids.push(entry?.file_name().to_string_lossy().to_string());
    }
    ids.sort();
    Ok(ids)
}

/// Firecracker machine config: kernel, rootfs + overlay drives, tap NIC
/// with the deterministic MAC, and the vsock device carrying the
/// tenant's cid. Paths are chroot-relative.
pub fn render_machine_config(config: &LobsterdConfig, tenant: &Tenant) -> Result<String> {
    let idx = tenant.uid - config.tenants.uid_start;
    let boot_args = format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:255.255.255.252::eth0:off",
        tenant.guest_ip(),
        tenant.ip_address,
    );
    let cfg = json!({
        "boot-source": {
            "kernel_image_path": "/vmlinux",
            "boot_args": boot_args,
        },
        "drives": [
            {
                "drive_id": "rootfs",
                "path_on_host": "/rootfs.ext4",
                "is_root_device": true,
                "is_read_only": true,
            },
            {
                "drive_id": "overlay",
                "path_on_host": "/overlay.ext4",
                "is_root_device": false,
                "is_read_only": false,
            },
        ],
        "network-interfaces": [
            {
                "iface_id": "eth0",
                "guest_mac": naming::mac_address(idx),
                "host_dev_name": tenant.tap_dev,
            },
        ],
        "vsock": {
            "guest_cid": tenant.cid,
            "uds_path": "/v.sock",
        },
        "machine-config": {
            "vcpu_count": VCPUS,
            "mem_size_mib": MEM_MIB,
        },
    });
    serde_json::to_string_pretty(&cfg).map_err(|e| Error::JailerSetupFailed(e.to_string()))
}

/// Argv for launching the jailer, which execs Firecracker inside the
/// chroot as the tenant uid.
pub fn build_jailer_args(config: &LobsterdConfig, vm_id: &str, uid: u32) -> Vec<String> {
    vec![
        config.jailer.binary_path.clone(),
        "--id".to_string(),
        vm_id.to_string(),
        "--exec-file".to_string(),
        config.firecracker.binary_path.clone(),
        "--uid".to_string(),
        uid.to_string(),
        "--gid".to_string(),
        uid.to_string(),
        "--chroot-base-dir".to_string(),
        config.jailer.chroot_base_dir.clone(),
        "--".to_string(),
        "--api-sock".to_string(),
        "/api.sock".to_string(),
        "--config-file".to_string(),
        "/fc.json".to_string(),
    ]
}

/// Launch Firecracker under the jailer. Returns the jailer pid once the
/// API socket shows up.
pub async fn launch(config: &LobsterdConfig, tenant: &Tenant) -> Result<u32> {
    let root = chroot_root(&config.jailer.chroot_base_dir, &tenant.vm_id);
    let api_sock = root.join("api.sock");
    let _ = fs::remove_file(&api_sock);
    let _ = fs::remove_file(root.join("v.sock"));

    let argv = build_jailer_args(config, &tenant.vm_id, tenant.uid);
    let log = fs::File::create(root.join("firecracker.log"))?;

    let mut cmd = std::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log.try_clone()?))
        .stderr(std::process::Stdio::from(log));
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = tokio::process::Command::from(cmd)
        .spawn()
        .map_err(|e| Error::JailerSetupFailed(format!("spawn jailer: {}", e)))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::JailerSetupFailed("jailer exited immediately".to_string()))?;

    // Reap in the background; the VM outlives this call by design.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    let deadline = tokio::time::Instant::now() + API_SOCK_WAIT;
    while !api_sock.exists() {
        if tokio::time::Instant::now() >= deadline {
            let _ = terminate(pid, Duration::from_secs(1)).await;
            return Err(Error::JailerSetupFailed(format!(
                "firecracker api socket never appeared at {}",
                api_sock.display()
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!(vm_id = %tenant.vm_id, pid, "firecracker launched");
    Ok(pid)
}

/// Whether a pid is alive (signal 0 probe).
pub fn is_pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// SIGTERM a process, give it `grace` to exit, then SIGKILL.
pub async fn terminate(pid: u32, grace: Duration) -> Result<()> {
    if !is_pid_alive(pid) {
        return Ok(());
    }
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    let deadline = tokio::time::Instant::now() + grace;
    while is_pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            warn!(pid, "process survived SIGTERM, killing");
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LobsterdConfig {
        LobsterdConfig::default()
    }

    fn test_tenant() -> Tenant {
        Tenant {
            name: "alice".to_string(),
            uid: 10000,
            cid: 3,
            gateway_port: 9000,
            ip_address: "10.231.0.1".to_string(),
            tap_dev: "tap-alice".to_string(),
            vm_id: "alice".to_string(),
            vm_pid: None,
            agent_token: "tok".to_string(),
            home_path: "/var/lib/lobsterd/homes/alice".to_string(),
            status: lobster_core::tenant::TenantStatus::Initializing,
            suspend_info: None,
            ssh_public_key: String::new(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            repair_attempts: 0,
            wake_schedule: None,
        }
    }

    #[test]
    fn test_chroot_layout() {
        assert_eq!(
            chroot_root("/var/lib/lobsterd/jailer", "alice"),
            PathBuf::from("/var/lib/lobsterd/jailer/firecracker/alice/root")
        );
        assert_eq!(
            vsock_uds_path("/var/lib/lobsterd/jailer", "alice"),
            PathBuf::from("/var/lib/lobsterd/jailer/firecracker/alice/root/v.sock")
        );
    }

    #[test]
    fn test_jailer_args_shape() {
        let args = build_jailer_args(&test_config(), "alice", 10000);
        assert_eq!(args[0], "/usr/local/bin/jailer");
        let joined = args.join(" ");
        assert!(joined.contains("--id alice"));
        assert!(joined.contains("--uid 10000"));
        assert!(joined.contains("--gid 10000"));
        assert!(joined.contains("-- --api-sock /api.sock"));
    }

    #[test]
    fn test_machine_config_contents() {
        let json = render_machine_config(&test_config(), &test_tenant()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["vsock"]["guest_cid"], 3);
        assert_eq!(v["network-interfaces"][0]["host_dev_name"], "tap-alice");
        assert_eq!(v["drives"][0]["is_read_only"], true);
        assert_eq!(v["drives"][1]["is_read_only"], false);
        let boot_args = v["boot-source"]["boot_args"].as_str().unwrap();
        assert!(boot_args.contains("ip=10.231.0.2::10.231.0.1"));
    }

    #[test]
    fn test_is_pid_alive_self_and_bogus() {
        assert!(is_pid_alive(std::process::id()));
        // Pid far above pid_max.
        assert!(!is_pid_alive(4_000_000));
    }

    #[test]
    fn test_link_into_copies_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"kernel bits").unwrap();
        link_into(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"kernel bits");
        // Overwriting an existing link is fine.
        link_into(&src, &dst).unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_chroot_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        cleanup_chroot(dir.path().to_str().unwrap(), "ghost")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminate_dead_pid_is_ok() {
        terminate(4_000_000, Duration::from_millis(10)).await.unwrap();
    }
}
