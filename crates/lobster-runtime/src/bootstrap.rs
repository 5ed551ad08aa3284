use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::drivers::net;
use crate::drivers::proxy::ProxyDriver;
use crate::shell::{self, ExecOpts};
use lobster_core::config::{state_dir, LobsterdConfig, STATE_SUBDIRS};
use lobster_core::error::{Error, Result};
use lobster_core::registry::RegistryStore;

/// One host prerequisite, with how its probe went.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// What `init` verified and set up.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub checks: Vec<InitCheck>,
}

impl InitReport {
    fn record(&mut self, name: &str, detail: impl Into<String>) {
        self.checks.push(InitCheck {
            name: name.to_string(),
            ok: true,
            detail: detail.into(),
        });
    }
}

/// Validate the host, create the directory skeleton, write default
/// config and registry, and bring the reverse proxy to its base config.
///
/// Mandatory checks fail the whole init with the matching error kind;
/// the returned report lists everything that passed.
pub async fn init(config_path: &Path, proxy: &dyn ProxyDriver) -> Result<InitReport> {
    let mut report = InitReport { checks: Vec::new() };

    if !cfg!(target_os = "linux") {
        return Err(Error::NotLinux(std::env::consts::OS.to_string()));
    }
    report.record("os", "linux");

    if unsafe { libc::geteuid() } != 0 {
        return Err(Error::NotRoot);
    }
    report.record("root", "euid 0");

    match fs::metadata("/dev/kvm") {
        Ok(_) => report.record("kvm", "/dev/kvm present"),
        Err(e) => return Err(Error::KvmNotAvailable(e.to_string())),
    }

    let config = LobsterdConfig::load(config_path)?;

    if !is_executable(&config.firecracker.binary_path) {
        return Err(Error::FirecrackerNotFound(
            config.firecracker.binary_path.clone(),
        ));
    }
    report.record("firecracker", config.firecracker.binary_path.as_str());

    if !is_executable(&config.jailer.binary_path) {
        return Err(Error::JailerNotFound(config.jailer.binary_path.clone()));
    }
    report.record("jailer", config.jailer.binary_path.as_str());

    for (label, path) in [
        ("kernel", &config.firecracker.kernel_path),
        ("rootfs", &config.firecracker.rootfs_path),
    ] {
        if !Path::new(path).exists() {
            return Err(Error::ValidationFailed(format!(
                "{} image missing: {}",
                label, path
            )));
        }
        report.record(label, path.as_str());
    }

    // Guest vsock needs the host module; not fatal when built-in.
    match shell::exec_unchecked(
        &["modprobe", "vhost_vsock"],
        &ExecOpts::with_timeout(Duration::from_secs(10)),
    )
    .await
    {
        Ok(out) if out.success() => report.record("vhost_vsock", "module loaded"),
        Ok(out) => warn!(stderr = %out.stderr.trim(), "modprobe vhost_vsock failed"),
        Err(e) => warn!(error = %e, "modprobe vhost_vsock unavailable"),
    }

    let config_dir = LobsterdConfig::config_dir();
    create_dir_with_mode(&config_dir, 0o711)?;
    create_dir_with_mode(&LobsterdConfig::certs_dir(), 0o755)?;
    for sub in STATE_SUBDIRS {
        create_dir_with_mode(&state_dir().join(sub), 0o755)?;
    }
    report.record("directories", config_dir.display().to_string());

    if !config_path.exists() {
        config.save(config_path)?;
        report.record("config", format!("wrote {}", config_path.display()));
    } else {
        report.record("config", format!("kept {}", config_path.display()));
    }

    let store = RegistryStore::new(
        &config_dir,
        config.tenants.uid_start,
        config.tenants.gateway_port_start,
    );
    if !store.path().exists() {
        store.save(&store.load()?)?;
        report.record("registry", format!("wrote {}", store.path().display()));
    } else {
        store.load()?;
        report.record("registry", format!("kept {}", store.path().display()));
    }

    install_origin_certs(&mut report)?;

    net::enable_ip_forwarding().await?;
    report.record("ip-forwarding", "enabled");

    net::ensure_chain().await?;
    if let Some(uid) = proxy_uid().await {
        net::add_uid_bypass(uid).await?;
        report.record("firewall", format!("chain ready, proxy uid {} bypassed", uid));
    } else {
        report.record("firewall", "chain ready");
    }

    if !proxy.healthy().await {
        return Err(Error::ProxyError(
            "reverse proxy is not answering its admin api".to_string(),
        ));
    }
    proxy.write_base_config().await?;
    report.record("proxy", "base config loaded");

    info!(checks = report.checks.len(), "init complete");
    Ok(report)
}

/// Tighten modes on bundled origin TLS material when it is present.
fn install_origin_certs(report: &mut InitReport) -> Result<()> {
    let certs_dir = LobsterdConfig::certs_dir();
    let mut installed = 0;
    for file in ["origin.pem", "origin.key"] {
        let path = certs_dir.join(file);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => {
                fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
                installed += 1;
            }
            _ => {}
        }
    }
    if installed == 2 {
        report.record("certs", "origin material installed");
    } else {
        report.record("certs", "no origin material bundled");
    }
    Ok(())
}

/// Uid the reverse proxy runs as, for the firewall bypass rule.
async fn proxy_uid() -> Option<u32> {
    let out = shell::exec_unchecked(&["id", "-u", "caddy"], &ExecOpts::default())
        .await
        .ok()?;
    if !out.success() {
        return None;
    }
    out.stdout_trimmed().parse().ok()
}

fn is_executable(path: &str) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}
