use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Config directory: traversable but not listable (0711).
pub const CONFIG_DIR: &str = "/etc/lobsterd";
/// Runtime state root.
pub const STATE_DIR: &str = "/var/lib/lobsterd";
/// Runtime subdirectories created at init.
pub const STATE_SUBDIRS: &[&str] = &["overlays", "sockets", "kernels", "jailer", "ssh"];

/// Runtime state root, overridable for tests and packaging.
pub fn state_dir() -> PathBuf {
    PathBuf::from(std::env::var("LOBSTERD_STATE_DIR").unwrap_or_else(|_| STATE_DIR.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ZfsConfig {
    pub pool: String,
    pub parent_dataset: String,
    pub default_quota: String,
    pub compression: String,
    pub snapshot_retention: usize,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            pool: "tank".to_string(),
            parent_dataset: "tank/lobsterd".to_string(),
            default_quota: "10G".to_string(),
            compression: "zstd".to_string(),
            snapshot_retention: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TenantsConfig {
    pub uid_start: u32,
    pub gateway_port_start: u16,
    pub home_base: String,
}

impl Default for TenantsConfig {
    fn default() -> Self {
        Self {
            uid_start: 10000,
            gateway_port_start: 9000,
            home_base: "/var/lib/lobsterd/homes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WatchdogConfig {
    /// Idle-loop cadence.
    pub interval_ms: u64,
    /// Traffic-loop cadence for suspended tenants.
    pub traffic_poll_ms: u64,
    /// Sustained zero-connection time before auto-suspend.
    pub idle_threshold_ms: u64,
    /// Repair passes before a tenant goes degraded.
    pub max_repair_attempts: u32,
    /// Back-off between repair passes on the same tenant.
    pub repair_cooldown_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            traffic_poll_ms: 2_000,
            idle_threshold_ms: 300_000,
            max_repair_attempts: 3,
            repair_cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct FirecrackerConfig {
    pub binary_path: String,
    pub kernel_path: String,
    pub rootfs_path: String,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary_path: "/usr/local/bin/firecracker".to_string(),
            kernel_path: "/var/lib/lobsterd/kernels/vmlinux".to_string(),
            rootfs_path: "/var/lib/lobsterd/kernels/rootfs.ext4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct JailerConfig {
    pub binary_path: String,
    pub chroot_base_dir: String,
}

impl Default for JailerConfig {
    fn default() -> Self {
        Self {
            binary_path: "/usr/local/bin/jailer".to_string(),
            chroot_base_dir: "/var/lib/lobsterd/jailer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct VsockConfig {
    /// Port the in-guest agent listens on.
    pub agent_port: u32,
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self { agent_port: 52 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CaddyConfig {
    /// Base URL of the Caddy admin API.
    pub admin_api: String,
    /// Tenants are routed as `<name>.<domain>`.
    pub domain: String,
    /// Terminate TLS with the bundled origin material.
    pub tls: bool,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            admin_api: "http://127.0.0.1:2019".to_string(),
            domain: "lobster.local".to_string(),
            tls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct OpenclawConfig {
    pub install_path: String,
    /// Seed config handed to the in-guest gateway at spawn/resume.
    pub default_config: serde_json::Value,
    /// Named API keys injected as secrets.
    pub api_keys: BTreeMap<String, String>,
}

/// Root configuration, persisted at /etc/lobsterd/config.json.
///
/// Every section defaults, so a partial (or absent) file still loads;
/// unknown keys are rejected so typos surface at load time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LobsterdConfig {
    pub zfs: ZfsConfig,
    pub tenants: TenantsConfig,
    pub watchdog: WatchdogConfig,
    pub firecracker: FirecrackerConfig,
    pub jailer: JailerConfig,
    pub vsock: VsockConfig,
    pub caddy: CaddyConfig,
    pub openclaw: OpenclawConfig,
}

impl LobsterdConfig {
    pub fn config_dir() -> PathBuf {
        PathBuf::from(
            std::env::var("LOBSTERD_CONFIG_DIR").unwrap_or_else(|_| CONFIG_DIR.to_string()),
        )
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    pub fn certs_dir() -> PathBuf {
        Self::config_dir().join("certs")
    }

    pub fn state_dir() -> PathBuf {
        state_dir()
    }

    /// Load from the given path; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&json)
            .map_err(|e| Error::ValidationFailed(format!("config {}: {}", path.display(), e)))
    }

    /// Write as pretty JSON, mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::ValidationFailed(e.to_string()))?;
        fs::write(path, json.as_bytes())?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Dataset path backing one tenant's home.
    pub fn tenant_dataset(&self, name: &str) -> String {
        format!("{}/{}", self.zfs.parent_dataset, name)
    }

    /// Mountpoint of a tenant's home dataset.
    pub fn tenant_home(&self, name: &str) -> String {
        format!("{}/{}", self.tenants.home_base, name)
    }

    /// Public hostname routed to a tenant's gateway.
    pub fn tenant_host(&self, name: &str) -> String {
        format!("{}.{}", name, self.caddy.domain)
    }
}
