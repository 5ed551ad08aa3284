use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::drivers::proxy::ProxyDriver;
use crate::drivers::vsock::VsockClient;
use crate::drivers::{jailer, net, ssh, zfs};
use crate::gate::InFlightGate;
use lobster_core::config::LobsterdConfig;
use lobster_core::error::{Error, Result};
use lobster_core::registry::RegistryStore;
use lobster_core::tenant::{SuspendInfo, Tenant, TenantStatus};
use lobster_core::{naming, time};

/// How long a freshly booted guest gets to bring its agent up.
pub const AGENT_BOOT_TIMEOUT_MS: u64 = 60_000;
/// Grace after a vsock shutdown request before escalating to signals.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Grace between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Structured step stream consumed by the CLI while an operation runs.
pub trait Progress: Send + Sync {
    fn step(&self, op: &str, detail: &str);
}

/// Sink that drops all progress (scheduler-triggered operations).
pub struct Quiet;

impl Progress for Quiet {
    fn step(&self, _op: &str, _detail: &str) {}
}

/// Tenant lifecycle engine: composes the drivers into spawn, evict,
/// suspend, resume, and snap, with the registry as the source of truth.
pub struct TenantOps {
    config: LobsterdConfig,
    store: RegistryStore,
    proxy: Arc<dyn ProxyDriver>,
    gate: InFlightGate,
}

impl TenantOps {
    pub fn new(config: LobsterdConfig, store: RegistryStore, proxy: Arc<dyn ProxyDriver>) -> Self {
        Self {
            config,
            store,
            proxy,
            gate: InFlightGate::new(),
        }
    }

    pub fn config(&self) -> &LobsterdConfig {
        &self.config
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn proxy(&self) -> &Arc<dyn ProxyDriver> {
        &self.proxy
    }

    pub fn gate(&self) -> &InFlightGate {
        &self.gate
    }

    /// Create a tenant end to end. The registry row is written first so
    /// the allocations survive a crash; any later failure rolls the
    /// tenant back out and surfaces the original error.
    pub async fn spawn(&self, name: &str, progress: &dyn Progress) -> Result<Tenant> {
        naming::validate_tenant_name(name)?;
        let _guard = self.gate.begin(name)?;

        progress.step("reserve", "allocating uid, port, and addresses");
        let (_, tenant) = self.store.mutate(|reg| {
            if reg.find(name).is_some() {
                return Err(Error::TenantExists(name.to_string()));
            }
            let uid = reg.allocate_uid();
            let gateway_port = reg.allocate_gateway_port();
            let idx = uid - self.config.tenants.uid_start;
            let (host_ip, _) = naming::address_pair(idx);
            let tenant = Tenant {
                name: name.to_string(),
                uid,
                cid: naming::cid_for_uid(uid, self.config.tenants.uid_start),
                gateway_port,
                ip_address: host_ip,
                tap_dev: naming::tap_name(name),
                vm_id: name.to_string(),
                vm_pid: None,
                agent_token: naming::generate_agent_token(),
                home_path: self.config.tenant_home(name),
                status: TenantStatus::Initializing,
                suspend_info: None,
                ssh_public_key: String::new(),
                created_at: time::utc_now(),
                repair_attempts: 0,
                wake_schedule: None,
            };
            reg.insert(tenant.clone())?;
            Ok(tenant)
        })?;

        match self.build_tenant(&tenant, progress).await {
            Ok(built) => {
                info!(tenant = name, uid = built.uid, "tenant spawned");
                Ok(built)
            }
            Err(e) => {
                warn!(tenant = name, error = %e, "spawn failed, rolling back");
                self.teardown(&tenant, false).await;
                let _ = self.store.mutate(|reg| reg.remove(name).map(|_| ()));
                Err(e)
            }
        }
    }

    /// Steps 2-10 of spawn, separated so the caller owns the rollback.
    async fn build_tenant(&self, tenant: &Tenant, progress: &dyn Progress) -> Result<Tenant> {
        let name = tenant.name.as_str();
        let dataset = self.config.tenant_dataset(name);

        progress.step("zfs-dataset", &dataset);
        zfs::create_dataset(
            &dataset,
            &tenant.home_path,
            &self.config.zfs.default_quota,
            &self.config.zfs.compression,
        )
        .await?;

        progress.step("network", &tenant.tap_dev);
        net::create_tap(&tenant.tap_dev, tenant.uid).await?;
        net::assign_address(&tenant.tap_dev, &tenant.ip_address).await?;
        net::add_tenant_drop(tenant.uid).await?;

        progress.step("ssh-keypair", name);
        let public_key = ssh::generate_keypair(name).await?;
        self.store.mutate(|reg| {
            reg.get_mut(name)?.ssh_public_key = public_key.clone();
            Ok(())
        })?;

        progress.step("chroot", &tenant.vm_id);
        jailer::prepare_chroot(&self.config, tenant).await?;

        progress.step("vm-launch", &tenant.vm_id);
        let pid = jailer::launch(&self.config, tenant).await?;
        self.store.mutate(|reg| {
            reg.get_mut(name)?.vm_pid = Some(pid);
            Ok(())
        })?;

        progress.step("agent-wait", "waiting for in-guest agent on vsock");
        let client = VsockClient::for_tenant(&self.config, tenant);
        client.wait_for_agent(AGENT_BOOT_TIMEOUT_MS).await?;

        progress.step("secrets", "injecting gateway seed material");
        client.inject_secrets(self.secrets_payload(tenant)).await?;
        client.launch_openclaw().await?;

        progress.step("proxy-route", &self.config.tenant_host(name));
        self.proxy
            .add_route(name, &self.config.tenant_host(name), tenant.gateway_port)
            .await?;

        progress.step("activate", "all resources healthy");
        let (_, built) = self.store.mutate(|reg| {
            let row = reg.get_mut(name)?;
            row.status = TenantStatus::Active;
            Ok(row.clone())
        })?;
        Ok(built)
    }

    /// Seed material handed to the in-guest agent at spawn and resume.
    fn secrets_payload(&self, tenant: &Tenant) -> serde_json::Value {
        json!({
            "gatewayToken": tenant.agent_token,
            "gatewayPort": tenant.gateway_port,
            "openclaw": {
                "installPath": self.config.openclaw.install_path,
                "defaultConfig": self.config.openclaw.default_config,
                "apiKeys": self.config.openclaw.api_keys,
            },
        })
    }

    /// Destroy a tenant end to end, reverse of spawn. Missing resources
    /// are skipped; the registry row goes away last so a crashed evict
    /// can be resumed.
    pub async fn evict(
        &self,
        name: &str,
        final_snapshot: bool,
        progress: &dyn Progress,
    ) -> Result<()> {
        let _guard = self.gate.begin(name)?;

        let (_, tenant) = self.store.mutate(|reg| {
            let row = reg.get_mut(name)?;
            row.status = TenantStatus::Evicting;
            row.suspend_info = None;
            Ok(row.clone())
        })?;

        progress.step("teardown", name);
        if final_snapshot {
            let dataset = self.config.tenant_dataset(name);
            if zfs::dataset_exists(&dataset).await? {
                let tag = format!("evict-{}", time::snapshot_tag());
                progress.step("final-snapshot", &tag);
                zfs::snapshot(&dataset, &tag).await?;
            }
        }
        self.teardown(&tenant, !final_snapshot).await;

        progress.step("deregister", name);
        self.store.mutate(|reg| reg.remove(name).map(|_| ()))?;
        info!(tenant = name, "tenant evicted");
        Ok(())
    }

    /// Best-effort teardown of every live resource a tenant may hold,
    /// in reverse creation order. Failures are logged and skipped so
    /// the remaining resources still come down.
    pub(crate) async fn teardown(&self, tenant: &Tenant, destroy_dataset: bool) {
        let name = tenant.name.as_str();

        if let Err(e) = self.proxy.remove_route(name).await {
            warn!(tenant = name, error = %e, "teardown: proxy route");
        }

        let client = VsockClient::for_tenant(&self.config, tenant);
        if tenant.vm_pid.is_some() {
            let _ = client.shutdown().await;
        }
        if let Some(pid) = tenant.vm_pid {
            let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
            while jailer::is_pid_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if let Err(e) = jailer::terminate(pid, TERM_GRACE).await {
                warn!(tenant = name, pid, error = %e, "teardown: vm process");
            }
        }

        if let Err(e) = net::remove_tenant_drop(tenant.uid).await {
            warn!(tenant = name, error = %e, "teardown: firewall");
        }
        if let Err(e) = net::delete_tap(&tenant.tap_dev).await {
            warn!(tenant = name, error = %e, "teardown: tap");
        }
        if let Err(e) = jailer::cleanup_chroot(&self.config.jailer.chroot_base_dir, &tenant.vm_id).await
        {
            warn!(tenant = name, error = %e, "teardown: chroot");
        }
        if destroy_dataset {
            if let Err(e) = zfs::destroy_dataset(&self.config.tenant_dataset(name)).await {
                warn!(tenant = name, error = %e, "teardown: dataset");
            }
            let overlay = jailer::overlay_path(name);
            if overlay.exists() {
                let _ = std::fs::remove_file(overlay);
            }
        }
        if let Err(e) = ssh::remove_keypair(name) {
            warn!(tenant = name, error = %e, "teardown: ssh keys");
        }
    }

    /// Stop a tenant's VM while keeping its identity and routing intent.
    pub async fn suspend(&self, name: &str, progress: &dyn Progress) -> Result<Tenant> {
        let _guard = self.gate.begin(name)?;
        let tenant = self.store.load()?.get(name)?.clone();
        if tenant.status != TenantStatus::Active {
            return Err(Error::ValidationFailed(format!(
                "cannot suspend {:?} while {}",
                name, tenant.status
            )));
        }

        progress.step("record-traffic", &tenant.tap_dev);
        let last_rx_bytes = net::rx_bytes(&tenant.tap_dev).unwrap_or(0);

        progress.step("guest-shutdown", name);
        let client = VsockClient::for_tenant(&self.config, &tenant);
        let _ = client.shutdown().await;
        if let Some(pid) = tenant.vm_pid {
            let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
            while jailer::is_pid_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            jailer::terminate(pid, TERM_GRACE).await?;
        }

        let next_wake_at_ms = tenant
            .wake_schedule
            .as_deref()
            .and_then(|expr| next_wake_from_cron(expr, chrono::Utc::now()));

        progress.step("proxy-route", "removing route while suspended");
        self.proxy.remove_route(name).await?;

        progress.step("persist", "recording suspend state");
        let suspended_at_ms = time::now_ms();
        let (_, updated) = self.store.mutate(|reg| {
            let row = reg.get_mut(name)?;
            row.status = TenantStatus::Suspended;
            row.vm_pid = None;
            row.suspend_info = Some(SuspendInfo {
                last_rx_bytes,
                next_wake_at_ms,
                suspended_at_ms,
            });
            Ok(row.clone())
        })?;
        info!(tenant = name, last_rx_bytes, "tenant suspended");
        Ok(updated)
    }

    /// Relaunch a suspended tenant's VM and reinstate its route.
    pub async fn resume(&self, name: &str, progress: &dyn Progress) -> Result<Tenant> {
        let _guard = self.gate.begin(name)?;
        let tenant = self.store.load()?.get(name)?.clone();
        if tenant.status != TenantStatus::Suspended {
            return Err(Error::ValidationFailed(format!(
                "cannot resume {:?} while {}",
                name, tenant.status
            )));
        }

        progress.step("chroot", "re-linking chroot files");
        jailer::prepare_chroot(&self.config, &tenant).await?;

        progress.step("vm-launch", &tenant.vm_id);
        let pid = jailer::launch(&self.config, &tenant).await?;

        progress.step("agent-wait", "waiting for in-guest agent on vsock");
        let client = VsockClient::for_tenant(&self.config, &tenant);
        client.wait_for_agent(AGENT_BOOT_TIMEOUT_MS).await?;

        progress.step("secrets", "re-injecting gateway seed material");
        client.inject_secrets(self.secrets_payload(&tenant)).await?;
        client.launch_openclaw().await?;

        progress.step("proxy-route", &self.config.tenant_host(name));
        self.proxy
            .add_route(name, &self.config.tenant_host(name), tenant.gateway_port)
            .await?;

        let (_, updated) = self.store.mutate(|reg| {
            let row = reg.get_mut(name)?;
            row.status = TenantStatus::Active;
            row.vm_pid = Some(pid);
            row.suspend_info = None;
            Ok(row.clone())
        })?;
        info!(tenant = name, pid, "tenant resumed");
        Ok(updated)
    }

    /// Snapshot the tenant's dataset; with `prune`, keep only the newest
    /// `snapshotRetention` snapshots. Returns the created tag.
    pub async fn snap(&self, name: &str, prune: bool) -> Result<String> {
        let _guard = self.gate.begin(name)?;
        self.store.load()?.get(name)?;
        let dataset = self.config.tenant_dataset(name);
        let tag = time::snapshot_tag();
        zfs::snapshot(&dataset, &tag).await?;
        if prune {
            zfs::prune_snapshots(&dataset, self.config.zfs.snapshot_retention).await?;
        }
        Ok(tag)
    }

    /// Reconcile one tenant (or the whole fleet) against the registry.
    pub async fn molt(&self, target: Option<&str>) -> Result<crate::reconcile::MoltReport> {
        crate::reconcile::molt(self, target).await
    }
}

/// Next firing of a cron expression after `from`, epoch millis.
///
/// Accepts the common 5-field form by prepending a seconds column.
pub fn next_wake_from_cron(expr: &str, from: chrono::DateTime<chrono::Utc>) -> Option<u64> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    let schedule = match cron::Schedule::from_str(&normalized) {
        Ok(s) => s,
        Err(e) => {
            warn!(expr, error = %e, "unparseable wake schedule, ignoring");
            return None;
        }
    };
    schedule
        .after(&from)
        .next()
        .map(|dt| dt.timestamp_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::proxy::testing::MemProxy;
    use chrono::TimeZone;

    fn ops_with_store(dir: &std::path::Path) -> TenantOps {
        let config = LobsterdConfig::default();
        let store = RegistryStore::new(dir, 10000, 9000);
        TenantOps::new(config, store, Arc::new(MemProxy::default()))
    }

    fn seeded_tenant(status: TenantStatus) -> Tenant {
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
            status,
            suspend_info: if status == TenantStatus::Suspended {
                Some(SuspendInfo {
                    last_rx_bytes: 0,
                    next_wake_at_ms: None,
                    suspended_at_ms: 1,
                })
            } else {
                None
            },
            ssh_public_key: String::new(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            repair_attempts: 0,
            wake_schedule: None,
        }
    }

    fn seed(ops: &TenantOps, tenant: Tenant) {
        ops.store()
            .mutate(|reg| {
                reg.next_uid = tenant.uid + 1;
                reg.next_gateway_port = tenant.gateway_port + 1;
                reg.insert(tenant.clone())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_rejects_bad_name() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops_with_store(dir.path());
        let err = ops.spawn("Not-Valid!", &Quiet).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_spawn_rejects_existing_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops_with_store(dir.path());
        seed(&ops, seeded_tenant(TenantStatus::Active));
        let err = ops.spawn("alice", &Quiet).await.unwrap_err();
        assert!(matches!(err, Error::TenantExists(_)));
        // The existing row must be untouched by the failed spawn.
        assert_eq!(ops.store().load().unwrap().tenants.len(), 1);
    }

    #[tokio::test]
    async fn test_suspend_requires_active() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops_with_store(dir.path());
        seed(&ops, seeded_tenant(TenantStatus::Suspended));
        let err = ops.suspend("alice", &Quiet).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_resume_requires_suspended() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops_with_store(dir.path());
        seed(&ops, seeded_tenant(TenantStatus::Active));
        let err = ops.resume("alice", &Quiet).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_snap_unknown_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops_with_store(dir.path());
        let err = ops.snap("ghost", false).await.unwrap_err();
        assert!(matches!(err, Error::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn test_gate_blocks_second_operation() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops_with_store(dir.path());
        seed(&ops, seeded_tenant(TenantStatus::Active));
        let _held = ops.gate().begin("alice").unwrap();
        let err = ops.suspend("alice", &Quiet).await.unwrap_err();
        assert!(matches!(err, Error::OperationInFlight(_)));
    }

    #[test]
    fn test_next_wake_five_field_cron() {
        let from = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        // Daily at 09:00.
        let next = next_wake_from_cron("0 9 * * *", from).unwrap();
        let expected = chrono::Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap();
        assert_eq!(next, expected.timestamp_millis() as u64);
    }

    #[test]
    fn test_next_wake_six_field_cron() {
        let from = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let next = next_wake_from_cron("30 15 9 * * *", from).unwrap();
        let expected = chrono::Utc
            .with_ymd_and_hms(2026, 1, 2, 9, 15, 30)
            .unwrap();
        assert_eq!(next, expected.timestamp_millis() as u64);
    }

    #[test]
    fn test_next_wake_invalid_cron_is_none() {
        let from = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(next_wake_from_cron("not a cron", from), None);
    }

    #[test]
    fn test_secrets_payload_shape() {
        let dir = tempfile::tempdir().unwrap();
        let ops = ops_with_store(dir.path());
        let tenant = seeded_tenant(TenantStatus::Active);
        let payload = ops.secrets_payload(&tenant);
        assert_eq!(payload["gatewayToken"], "tok");
        assert_eq!(payload["gatewayPort"], 9000);
        assert!(payload["openclaw"].get("apiKeys").is_some());
    }
}
