use colored::Colorize;

use lobster_core::registry::TenantRegistry;
use lobster_core::tenant::{Tenant, TenantStatus};
use lobster_runtime::bootstrap::InitReport;
use lobster_runtime::drivers::jailer;
use lobster_runtime::reconcile::MoltReport;

/// Probed liveness for `list` and `tank`: the registry's word checked
/// against the actual process table.
pub fn probe_status(tenant: &Tenant) -> String {
    match tenant.status {
        TenantStatus::Active => match tenant.vm_pid {
            Some(pid) if jailer::is_pid_alive(pid) => "active".to_string(),
            Some(_) => "dead".to_string(),
            None => "unknown".to_string(),
        },
        other => other.to_string(),
    }
}

fn colorize_status(status: &str) -> String {
    match status {
        "active" => status.green().to_string(),
        "suspended" => status.blue().to_string(),
        "dead" | "degraded" => status.red().to_string(),
        "initializing" | "evicting" | "unknown" => status.yellow().to_string(),
        other => other.to_string(),
    }
}

pub fn print_tenant_table(registry: &TenantRegistry, domain: &str) {
    if registry.tenants.is_empty() {
        println!("no tenants");
        return;
    }
    println!(
        "{:<12} {:>6} {:>5} {:<12} {:>6} {:<10} HOST",
        "NAME", "UID", "CID", "STATUS", "PORT", "TAP"
    );
    for tenant in &registry.tenants {
        let status = probe_status(tenant);
        println!(
            "{:<12} {:>6} {:>5} {:<21} {:>6} {:<10} {}.{}",
            tenant.name,
            tenant.uid,
            tenant.cid,
            colorize_status(&status),
            tenant.gateway_port,
            tenant.tap_dev,
            tenant.name,
            domain,
        );
    }
}

pub fn print_tenant(tenant: &Tenant, domain: &str) {
    println!("{}", tenant.name.bold());
    println!("  status:   {}", colorize_status(&tenant.status.to_string()));
    println!("  uid/cid:  {}/{}", tenant.uid, tenant.cid);
    println!("  address:  {} -> {}", tenant.ip_address, tenant.guest_ip());
    println!("  gateway:  {}.{} -> 127.0.0.1:{}", tenant.name, domain, tenant.gateway_port);
    if let Some(pid) = tenant.vm_pid {
        println!("  vm pid:   {}", pid);
    }
    if let Some(info) = &tenant.suspend_info {
        println!("  suspended at {} ms, rx baseline {}", info.suspended_at_ms, info.last_rx_bytes);
        if let Some(wake) = info.next_wake_at_ms {
            println!("  next wake at {} ms", wake);
        }
    }
}

/// One-shot fleet overview for `tank`.
pub fn print_tank(registry: &TenantRegistry, domain: &str) {
    let total = registry.tenants.len();
    let by = |s: TenantStatus| registry.tenants.iter().filter(|t| t.status == s).count();
    println!(
        "{}  {} tenants: {} active, {} suspended, {} degraded",
        "lobster tank".bold(),
        total,
        by(TenantStatus::Active).to_string().green(),
        by(TenantStatus::Suspended).to_string().blue(),
        by(TenantStatus::Degraded).to_string().red(),
    );
    println!(
        "allocators: next uid {}, next port {}",
        registry.next_uid, registry.next_gateway_port
    );
    println!();
    print_tenant_table(registry, domain);
}

pub fn print_molt_report(report: &MoltReport) {
    for result in &report.tenants {
        let mark = if result.healthy {
            "ok".green()
        } else {
            "unhealthy".red()
        };
        let mut line = format!("{:<12} {}", result.name, mark);
        if !result.actions.is_empty() {
            line.push_str(&format!("  repaired: {}", result.actions.join(", ")));
        }
        if !result.failures.is_empty() {
            line.push_str(&format!("  failing: {}", result.failures.join(", ")));
        }
        println!("{}", line);
    }
    for orphan in &report.orphans_removed {
        println!("collected orphan {}", orphan);
    }
    if report.tenants.is_empty() && report.orphans_removed.is_empty() {
        println!("nothing to reconcile");
    }
}

pub fn print_init_report(report: &InitReport) {
    for check in &report.checks {
        println!("{} {:<14} {}", "ok".green(), check.name, check.detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(status: TenantStatus, vm_pid: Option<u32>) -> Tenant {
        Tenant {
            name: "alice".to_string(),
            uid: 10000,
            cid: 3,
            gateway_port: 9000,
            ip_address: "10.231.0.1".to_string(),
            tap_dev: "tap-alice".to_string(),
            vm_id: "alice".to_string(),
            vm_pid,
            agent_token: "tok".to_string(),
            home_path: "/var/lib/lobsterd/homes/alice".to_string(),
            status,
            suspend_info: None,
            ssh_public_key: String::new(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            repair_attempts: 0,
            wake_schedule: None,
        }
    }

    #[test]
    fn test_probe_status_dead_vm() {
        // A pid far past pid_max cannot be alive.
        let t = tenant(TenantStatus::Active, Some(4_000_000));
        assert_eq!(probe_status(&t), "dead");
    }

    #[test]
    fn test_probe_status_live_vm() {
        let t = tenant(TenantStatus::Active, Some(std::process::id()));
        assert_eq!(probe_status(&t), "active");
    }

    #[test]
    fn test_probe_status_active_without_pid() {
        let t = tenant(TenantStatus::Active, None);
        assert_eq!(probe_status(&t), "unknown");
    }

    #[test]
    fn test_probe_status_non_active_passthrough() {
        let t = tenant(TenantStatus::Degraded, None);
        assert_eq!(probe_status(&t), "degraded");
    }
}
