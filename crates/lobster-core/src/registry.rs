use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tenant::{Tenant, TenantStatus};

/// The persistent tenant catalog plus the two monotone allocators.
///
/// The registry is the sole source of truth for tenant existence; live
/// resources with no matching row are orphans for the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRegistry {
    pub tenants: Vec<Tenant>,
    /// Strictly greater than every uid ever assigned, even after eviction.
    pub next_uid: u32,
    /// Same monotonicity contract as `next_uid`.
    pub next_gateway_port: u16,
}

impl TenantRegistry {
    pub fn empty(uid_start: u32, gateway_port_start: u16) -> Self {
        Self {
            tenants: Vec::new(),
            next_uid: uid_start,
            next_gateway_port: gateway_port_start,
        }
    }

    pub fn find(&self, name: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|t| t.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Tenant> {
        self.tenants.iter_mut().find(|t| t.name == name)
    }

    pub fn get(&self, name: &str) -> Result<&Tenant> {
        self.find(name)
            .ok_or_else(|| Error::TenantNotFound(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Tenant> {
        self.find_mut(name)
            .ok_or_else(|| Error::TenantNotFound(name.to_string()))
    }

    /// Advance the uid allocator. Allocators only move forward; evicted
    /// uids are never handed out again.
    pub fn allocate_uid(&mut self) -> u32 {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    pub fn allocate_gateway_port(&mut self) -> u16 {
        let port = self.next_gateway_port;
        self.next_gateway_port += 1;
        port
    }

    pub fn insert(&mut self, tenant: Tenant) -> Result<()> {
        if self.find(&tenant.name).is_some() {
            return Err(Error::TenantExists(tenant.name));
        }
        self.tenants.push(tenant);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Tenant> {
        let idx = self
            .tenants
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| Error::TenantNotFound(name.to_string()))?;
        Ok(self.tenants.remove(idx))
    }

    /// Check the registry invariants: per-tenant uniqueness of identity
    /// fields, allocators strictly above every assignment, and the
    /// status/suspend-info pairing.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut uids = HashSet::new();
        let mut cids = HashSet::new();
        let mut ports = HashSet::new();
        let mut taps = HashSet::new();
        let mut ips = HashSet::new();

        for t in &self.tenants {
            if !names.insert(&t.name) {
                return Err(Error::ValidationFailed(format!(
                    "duplicate tenant name {:?}",
                    t.name
                )));
            }
            if !uids.insert(t.uid) {
                return Err(Error::ValidationFailed(format!("duplicate uid {}", t.uid)));
            }
            if !cids.insert(t.cid) {
                return Err(Error::ValidationFailed(format!("duplicate cid {}", t.cid)));
            }
            if !ports.insert(t.gateway_port) {
                return Err(Error::ValidationFailed(format!(
                    "duplicate gateway port {}",
                    t.gateway_port
                )));
            }
            if !taps.insert(&t.tap_dev) {
                return Err(Error::ValidationFailed(format!(
                    "duplicate tap device {:?}",
                    t.tap_dev
                )));
            }
            if !ips.insert(&t.ip_address) {
                return Err(Error::ValidationFailed(format!(
                    "duplicate address {:?}",
                    t.ip_address
                )));
            }
            if t.uid >= self.next_uid {
                return Err(Error::ValidationFailed(format!(
                    "uid {} not below allocator {}",
                    t.uid, self.next_uid
                )));
            }
            if t.gateway_port >= self.next_gateway_port {
                return Err(Error::ValidationFailed(format!(
                    "gateway port {} not below allocator {}",
                    t.gateway_port, self.next_gateway_port
                )));
            }
            let suspended = t.status == TenantStatus::Suspended;
            if suspended != t.suspend_info.is_some() {
                return Err(Error::ValidationFailed(format!(
                    "tenant {:?}: suspendInfo must be present iff suspended",
                    t.name
                )));
            }
            if suspended && t.vm_pid.is_some() {
                return Err(Error::ValidationFailed(format!(
                    "tenant {:?}: suspended row must not carry a vmPid",
                    t.name
                )));
            }
        }
        Ok(())
    }
}

/// On-disk registry store: canonical JSON file with atomic writes and an
/// advisory exclusive lock serializing mutations.
pub struct RegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
    uid_start: u32,
    gateway_port_start: u16,
}

impl RegistryStore {
    pub fn new(config_dir: &Path, uid_start: u32, gateway_port_start: u16) -> Self {
        Self {
            path: config_dir.join("registry.json"),
            lock_path: config_dir.join(".registry.lock"),
            uid_start,
            gateway_port_start,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry. A missing file is the empty registry.
    pub fn load(&self) -> Result<TenantRegistry> {
        let json = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TenantRegistry::empty(self.uid_start, self.gateway_port_start));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&json).map_err(|e| Error::RegistryCorrupt(e.to_string()))
    }

    /// Write the registry atomically: tmp file sibling, then rename.
    pub fn save(&self, registry: &TenantRegistry) -> Result<()> {
        registry.validate()?;
        let json = serde_json::to_string_pretty(registry)
            .map_err(|e| Error::RegistryCorrupt(e.to_string()))?;
        let tmp = self
            .path
            .with_extension(format!("json.tmp.{}", std::process::id()));
        fs::write(&tmp, json.as_bytes())?;
        set_mode_0600(&tmp)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), tenants = registry.tenants.len(), "registry saved");
        Ok(())
    }

    /// Load, apply the caller's update, save, and return the new registry.
    ///
    /// An exclusive advisory lock on the config directory guards the whole
    /// critical section; a concurrent mutate observes `RegistryLocked`
    /// instead of blocking. Allocators are advanced only inside here.
    pub fn mutate<T>(
        &self,
        f: impl FnOnce(&mut TenantRegistry) -> Result<T>,
    ) -> Result<(TenantRegistry, T)> {
        let lock = self.acquire_lock()?;
        let mut registry = self.load()?;
        let out = f(&mut registry)?;
        self.save(&registry)?;
        drop(lock);
        Ok((registry, out))
    }

    fn acquire_lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        file.try_lock_exclusive().map_err(|_| Error::RegistryLocked)?;
        Ok(file)
    }
}

fn set_mode_0600(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}
