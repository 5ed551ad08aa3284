use serde::{Deserialize, Serialize};

/// Tenant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Degraded,
    Initializing,
    Evicting,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Degraded => write!(f, "degraded"),
            Self::Initializing => write!(f, "initializing"),
            Self::Evicting => write!(f, "evicting"),
        }
    }
}

/// Bookkeeping recorded while a tenant's VM is torn down to disk.
///
/// Present iff `status == Suspended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendInfo {
    /// rx_bytes counter of the TAP device at suspend time. The traffic
    /// loop resumes the tenant when the live counter exceeds this.
    pub last_rx_bytes: u64,
    /// Next cron-scheduled wake, epoch millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake_at_ms: Option<u64>,
    /// When the suspend completed, epoch millis.
    pub suspended_at_ms: u64,
}

/// One microVM tenant: identity, allocations, and runtime state.
///
/// Persisted as a registry row; field names are the on-disk JSON contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    /// DNS-label identifier, the stable primary key.
    pub name: String,
    /// Dedicated host uid, allocated monotonically, never reused.
    pub uid: u32,
    /// Vsock context id, paired 1:1 with `uid`.
    pub cid: u32,
    /// Host-loopback port the in-VM gateway is exposed on.
    pub gateway_port: u16,
    /// Host-side /30 TAP address; the guest takes the next address up.
    pub ip_address: String,
    /// Host TAP interface name.
    pub tap_dev: String,
    /// Jailer chroot id.
    pub vm_id: String,
    /// Pid of the running jailer process, absent when not running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_pid: Option<u32>,
    /// Shared secret authenticating RPC to the in-guest agent.
    pub agent_token: String,
    /// Mountpoint of the tenant's ZFS-backed home.
    pub home_path: String,
    pub status: TenantStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_info: Option<SuspendInfo>,
    pub ssh_public_key: String,
    pub created_at: String,
    /// Consecutive failed repair passes; past the configured bound the
    /// tenant goes degraded and the reconciler leaves it alone.
    #[serde(default)]
    pub repair_attempts: u32,
    /// Optional cron expression for scheduled wakes while suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_schedule: Option<String>,
}

impl Tenant {
    /// Guest-side address of the tenant's /30 pair.
    pub fn guest_ip(&self) -> String {
        let mut octets: Vec<u32> = self
            .ip_address
            .split('.')
            .filter_map(|o| o.parse().ok())
            .collect();
        if let Some(last) = octets.last_mut() {
            *last += 1;
        }
        octets
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Whether this row should be backed by a live VM process. Active
    /// tenants are, and degraded tenants are repaired back toward one;
    /// suspended, initializing, and evicting rows carry no VM claim.
    pub fn expects_vm(&self) -> bool {
        matches!(self.status, TenantStatus::Active | TenantStatus::Degraded)
    }
}
