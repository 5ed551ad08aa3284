use serde::Serialize;
use tracing::{info, warn};

use crate::drivers::vsock::VsockClient;
use crate::drivers::{jailer, net, zfs};
use crate::lifecycle::{TenantOps, AGENT_BOOT_TIMEOUT_MS};
use lobster_core::error::Result;
use lobster_core::registry::TenantRegistry;
use lobster_core::tenant::{Tenant, TenantStatus};

/// Outcome of reconciling one tenant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoltResult {
    pub name: String,
    pub healthy: bool,
    /// Repairs performed, in check order.
    pub actions: Vec<String>,
    /// Resource kinds that could not be brought in line.
    pub failures: Vec<String>,
}

/// Full reconciliation pass: per-tenant results plus any orphaned
/// resources collected (fleet-wide runs only).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoltReport {
    pub tenants: Vec<MoltResult>,
    pub orphans_removed: Vec<String>,
}

/// Bring live state back into alignment with the registry.
///
/// A targeted run (`molt <name>`) is an operator action: it also clears
/// a degraded tenant's repair bound. The fleet-wide run skips degraded
/// tenants and finishes with an orphan sweep.
pub async fn molt(ops: &TenantOps, target: Option<&str>) -> Result<MoltReport> {
    let registry = ops.store().load()?;
    let mut tenants = Vec::new();

    match target {
        Some(name) => {
            let tenant = registry.get(name)?.clone();
            tenants.push(molt_tenant(ops, &tenant, true).await);
        }
        None => {
            for tenant in &registry.tenants {
                tenants.push(molt_tenant(ops, tenant, false).await);
            }
        }
    }

    let orphans_removed = if target.is_none() {
        sweep_orphans(ops, &registry).await
    } else {
        Vec::new()
    };

    Ok(MoltReport {
        tenants,
        orphans_removed,
    })
}

async fn molt_tenant(ops: &TenantOps, tenant: &Tenant, operator_directed: bool) -> MoltResult {
    let name = tenant.name.clone();
    let mut result = MoltResult {
        name: name.clone(),
        healthy: false,
        actions: Vec::new(),
        failures: Vec::new(),
    };

    let _guard = match ops.gate().begin(&name) {
        Ok(g) => g,
        Err(_) => {
            result.failures.push("operation-in-flight".to_string());
            return result;
        }
    };

    if tenant.status == TenantStatus::Degraded && !operator_directed {
        result.failures.push("degraded".to_string());
        return result;
    }

    // A row stuck mid-spawn or mid-evict is finished off via the
    // lifecycle teardown; allocations stay burned.
    if matches!(
        tenant.status,
        TenantStatus::Initializing | TenantStatus::Evicting
    ) {
        ops.teardown(tenant, true).await;
        match ops.store().mutate(|reg| reg.remove(&name).map(|_| ())) {
            Ok(_) => {
                info!(tenant = %name, status = %tenant.status, "removed half-built tenant");
                result.healthy = true;
                result.actions.push("evicted-incomplete".to_string());
            }
            Err(e) => {
                warn!(tenant = %name, error = %e, "failed to remove half-built row");
                result.failures.push("registry".to_string());
            }
        }
        return result;
    }

    check_and_repair(ops, tenant, &mut result).await;

    result.healthy = result.failures.is_empty();
    let max = ops.config().watchdog.max_repair_attempts;
    let healthy = result.healthy;
    let outcome = ops.store().mutate(|reg| {
        let row = reg.get_mut(&name)?;
        if healthy {
            row.repair_attempts = 0;
            if row.status == TenantStatus::Degraded {
                row.status = TenantStatus::Active;
            }
        } else {
            row.repair_attempts += 1;
            if row.repair_attempts > max && row.status != TenantStatus::Degraded {
                row.status = TenantStatus::Degraded;
                return Ok(true);
            }
        }
        Ok(false)
    });
    match outcome {
        Ok((_, true)) => {
            warn!(tenant = %name, "repair attempts exceeded, tenant degraded");
        }
        Ok((_, false)) => {}
        Err(e) => {
            warn!(tenant = %name, error = %e, "failed to record repair outcome");
            result.failures.push("registry".to_string());
            result.healthy = false;
        }
    }
    result
}

/// Check every declared resource and perform the smallest recreating
/// action for each mismatch. Check failures are recorded and the pass
/// moves on, so one broken resource never hides the rest.
async fn check_and_repair(ops: &TenantOps, tenant: &Tenant, result: &mut MoltResult) {
    let config = ops.config();
    let name = tenant.name.as_str();
    let expects_vm = tenant.expects_vm();

    // Dataset
    let dataset = config.tenant_dataset(name);
    match zfs::dataset_exists(&dataset).await {
        Ok(true) => {}
        Ok(false) => {
            match zfs::create_dataset(
                &dataset,
                &tenant.home_path,
                &config.zfs.default_quota,
                &config.zfs.compression,
            )
            .await
            {
                Ok(()) => result.actions.push("zfs-dataset".to_string()),
                Err(e) => {
                    warn!(tenant = name, error = %e, "repair: dataset");
                    result.failures.push("zfs-dataset".to_string());
                }
            }
        }
        Err(e) => {
            warn!(tenant = name, error = %e, "check: dataset");
            result.failures.push("zfs-dataset".to_string());
        }
    }

    // TAP device and its address
    match net::tap_exists(&tenant.tap_dev).await {
        Ok(true) => match net::tap_address(&tenant.tap_dev).await {
            Ok(Some(addr)) if addr == tenant.ip_address => {}
            Ok(_) => match net::assign_address(&tenant.tap_dev, &tenant.ip_address).await {
                Ok(()) => result.actions.push("tap-address".to_string()),
                Err(e) => {
                    warn!(tenant = name, error = %e, "repair: tap address");
                    result.failures.push("tap-address".to_string());
                }
            },
            Err(e) => {
                warn!(tenant = name, error = %e, "check: tap address");
                result.failures.push("tap-address".to_string());
            }
        },
        Ok(false) => {
            let recreate = async {
                net::create_tap(&tenant.tap_dev, tenant.uid).await?;
                net::assign_address(&tenant.tap_dev, &tenant.ip_address).await
            };
            match recreate.await {
                Ok(()) => result.actions.push("tap".to_string()),
                Err(e) => {
                    warn!(tenant = name, error = %e, "repair: tap");
                    result.failures.push("tap".to_string());
                }
            }
        }
        Err(e) => {
            warn!(tenant = name, error = %e, "check: tap");
            result.failures.push("tap".to_string());
        }
    }

    // Firewall drop rule
    match net::tenant_drop_present(tenant.uid).await {
        Ok(true) => {}
        Ok(false) => match net::add_tenant_drop(tenant.uid).await {
            Ok(()) => result.actions.push("firewall".to_string()),
            Err(e) => {
                warn!(tenant = name, error = %e, "repair: firewall");
                result.failures.push("firewall".to_string());
            }
        },
        Err(e) => {
            warn!(tenant = name, error = %e, "check: firewall");
            result.failures.push("firewall".to_string());
        }
    }

    if !expects_vm {
        return;
    }

    // Chroot tree
    if !jailer::chroot_exists(&config.jailer.chroot_base_dir, &tenant.vm_id) {
        match jailer::prepare_chroot(config, tenant).await {
            Ok(()) => result.actions.push("chroot".to_string()),
            Err(e) => {
                warn!(tenant = name, error = %e, "repair: chroot");
                result.failures.push("chroot".to_string());
            }
        }
    }

    // VM process
    let vm_alive = tenant.vm_pid.map(jailer::is_pid_alive).unwrap_or(false);
    if !vm_alive {
        match relaunch_vm(ops, tenant).await {
            Ok(()) => result.actions.push("vm".to_string()),
            Err(e) => {
                warn!(tenant = name, error = %e, "repair: vm");
                result.failures.push("vm".to_string());
            }
        }
    }

    // Proxy route
    match ops.proxy().list_routes().await {
        Ok(routes) => {
            let present = routes
                .iter()
                .any(|r| r.name == name && r.upstream_port == tenant.gateway_port);
            if !present {
                match ops
                    .proxy()
                    .add_route(name, &config.tenant_host(name), tenant.gateway_port)
                    .await
                {
                    Ok(()) => result.actions.push("proxy-route".to_string()),
                    Err(e) => {
                        warn!(tenant = name, error = %e, "repair: proxy route");
                        result.failures.push("proxy-route".to_string());
                    }
                }
            }
        }
        Err(e) => {
            warn!(tenant = name, error = %e, "check: proxy routes");
            result.failures.push("proxy-route".to_string());
        }
    }

    // Agent responsiveness; the VM repair above already restarted a
    // dead VM, so an unreachable agent here is a real failure.
    let client = VsockClient::for_tenant(config, tenant);
    if client.health_ping().await.is_err() {
        result.failures.push("agent".to_string());
    }
}

/// Restart a dead VM for an active tenant: refresh the chroot, launch,
/// wait for the agent, and re-seed it.
async fn relaunch_vm(ops: &TenantOps, tenant: &Tenant) -> Result<()> {
    let config = ops.config();
    jailer::prepare_chroot(config, tenant).await?;
    let pid = jailer::launch(config, tenant).await?;
    let client = VsockClient::for_tenant(config, tenant);
    client.wait_for_agent(AGENT_BOOT_TIMEOUT_MS).await?;
    client
        .inject_secrets(serde_json::json!({
            "gatewayToken": tenant.agent_token,
            "gatewayPort": tenant.gateway_port,
            "openclaw": {
                "installPath": config.openclaw.install_path,
                "defaultConfig": config.openclaw.default_config,
                "apiKeys": config.openclaw.api_keys,
            },
        }))
        .await?;
    client.launch_openclaw().await?;
    ops.store().mutate(|reg| {
        reg.get_mut(&tenant.name)?.vm_pid = Some(pid);
        Ok(())
    })?;
    Ok(())
}

/// Collect live resources with no registry row. Each category is
/// best-effort so a missing tool never aborts the sweep.
async fn sweep_orphans(ops: &TenantOps, registry: &TenantRegistry) -> Vec<String> {
    let config = ops.config();
    let mut removed = Vec::new();

    match zfs::list_children(&config.zfs.parent_dataset).await {
        Ok(children) => {
            for dataset in children {
                let name = dataset.rsplit('/').next().unwrap_or_default();
                if registry.find(name).is_none() {
                    match zfs::destroy_dataset(&dataset).await {
                        Ok(()) => removed.push(format!("dataset:{}", name)),
                        Err(e) => warn!(dataset, error = %e, "orphan sweep: dataset"),
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "orphan sweep: listing datasets"),
    }

    match net::list_taps("tap-") {
        Ok(taps) => {
            for tap in taps {
                if !registry.tenants.iter().any(|t| t.tap_dev == tap) {
                    match net::delete_tap(&tap).await {
                        Ok(()) => removed.push(format!("tap:{}", tap)),
                        Err(e) => warn!(tap, error = %e, "orphan sweep: tap"),
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "orphan sweep: listing taps"),
    }

    match jailer::list_chroots(&config.jailer.chroot_base_dir) {
        Ok(ids) => {
            for vm_id in ids {
                if !registry.tenants.iter().any(|t| t.vm_id == vm_id) {
                    match jailer::cleanup_chroot(&config.jailer.chroot_base_dir, &vm_id).await {
                        Ok(()) => removed.push(format!("chroot:{}", vm_id)),
                        Err(e) => warn!(vm_id, error = %e, "orphan sweep: chroot"),
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "orphan sweep: listing chroots"),
    }

    match ops.proxy().list_routes().await {
        Ok(routes) => {
            for route in routes {
                if registry.find(&route.name).is_none() {
                    match ops.proxy().remove_route(&route.name).await {
                        Ok(()) => removed.push(format!("route:{}", route.name)),
                        Err(e) => warn!(route = %route.name, error = %e, "orphan sweep: route"),
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "orphan sweep: listing routes"),
    }

    if !removed.is_empty() {
        info!(count = removed.len(), "orphaned resources collected");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::proxy::testing::MemProxy;
    use crate::lifecycle::Quiet;
    use lobster_core::config::LobsterdConfig;
    use lobster_core::registry::RegistryStore;
    use lobster_core::tenant::SuspendInfo;
    use std::sync::Arc;

    fn ops(dir: &std::path::Path) -> TenantOps {
        ops_with_max_attempts(dir, 3)
    }

    fn ops_with_max_attempts(dir: &std::path::Path, max: u32) -> TenantOps {
        let mut config = LobsterdConfig::default();
        config.watchdog.max_repair_attempts = max;
        let store = RegistryStore::new(dir, 10000, 9000);
        TenantOps::new(config, store, Arc::new(MemProxy::default()))
    }

    fn row(name: &str, status: TenantStatus) -> Tenant {
        Tenant {
            name: name.to_string(),
            uid: 10000,
            cid: 3,
            gateway_port: 9000,
            ip_address: "10.231.0.1".to_string(),
            tap_dev: format!("tap-{}", name),
            vm_id: name.to_string(),
            vm_pid: None,
            agent_token: "tok".to_string(),
            home_path: format!("/var/lib/lobsterd/homes/{}", name),
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
    async fn test_molt_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let report = molt(&ops(dir.path()), None).await.unwrap();
        assert!(report.tenants.is_empty());
    }

    #[tokio::test]
    async fn test_molt_unknown_target() {
        let dir = tempfile::tempdir().unwrap();
        let err = molt(&ops(dir.path()), Some("ghost")).await.unwrap_err();
        assert!(matches!(
            err,
            lobster_core::error::Error::TenantNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_fleet_molt_skips_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let o = ops(dir.path());
        seed(&o, row("alice", TenantStatus::Degraded));
        let report = molt(&o, None).await.unwrap();
        assert_eq!(report.tenants.len(), 1);
        assert!(!report.tenants[0].healthy);
        assert_eq!(report.tenants[0].failures, vec!["degraded"]);
        assert!(report.tenants[0].actions.is_empty());
    }

    #[tokio::test]
    async fn test_molt_skips_in_flight_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let o = ops(dir.path());
        seed(&o, row("alice", TenantStatus::Active));
        let _held = o.gate().begin("alice").unwrap();
        let report = molt(&o, None).await.unwrap();
        assert_eq!(report.tenants[0].failures, vec!["operation-in-flight"]);
    }

    #[tokio::test]
    async fn test_molt_evicts_half_built_row() {
        let dir = tempfile::tempdir().unwrap();
        let o = ops(dir.path());
        seed(&o, row("alice", TenantStatus::Initializing));
        let report = molt(&o, None).await.unwrap();
        assert!(report.tenants[0].healthy);
        assert_eq!(report.tenants[0].actions, vec!["evicted-incomplete"]);
        // Row is gone, allocator stays burned.
        let reg = o.store().load().unwrap();
        assert!(reg.tenants.is_empty());
        assert_eq!(reg.next_uid, 10001);
    }

    #[tokio::test]
    async fn test_failing_repairs_eventually_degrade() {
        // No zfs/ip/iptables in the test environment, so every check
        // fails; with the bound at 1 the second failing pass degrades.
        let dir = tempfile::tempdir().unwrap();
        let o = ops_with_max_attempts(dir.path(), 1);
        seed(&o, row("alice", TenantStatus::Active));

        let first = molt(&o, None).await.unwrap();
        assert!(!first.tenants[0].healthy);
        assert_eq!(
            o.store().load().unwrap().get("alice").unwrap().status,
            TenantStatus::Active
        );

        let _second = molt(&o, None).await.unwrap();
        assert_eq!(
            o.store().load().unwrap().get("alice").unwrap().status,
            TenantStatus::Degraded
        );

        // And the degraded tenant is now left alone by fleet molt.
        let third = molt(&o, None).await.unwrap();
        assert_eq!(third.tenants[0].failures, vec!["degraded"]);
    }

    #[tokio::test]
    async fn test_suspended_tenant_not_probed_for_vm() {
        // A suspended tenant only needs dataset/tap/firewall; since
        // those tools are absent here the failures list must contain
        // exactly those kinds, never vm/proxy/agent.
        let dir = tempfile::tempdir().unwrap();
        let o = ops(dir.path());
        seed(&o, row("alice", TenantStatus::Suspended));
        let report = molt(&o, None).await.unwrap();
        let failures = &report.tenants[0].failures;
        assert!(!failures.contains(&"vm".to_string()));
        assert!(!failures.contains(&"agent".to_string()));
        assert!(!failures.contains(&"proxy-route".to_string()));
    }

    #[tokio::test]
    async fn test_orphan_route_swept() {
        let dir = tempfile::tempdir().unwrap();
        let o = ops(dir.path());
        o.proxy()
            .add_route("ghost", "ghost.lobster.local", 9999)
            .await
            .unwrap();
        let report = molt(&o, None).await.unwrap();
        assert!(report
            .orphans_removed
            .contains(&"route:ghost".to_string()));
        assert!(o.proxy().list_routes().await.unwrap().is_empty());
    }
}
