use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EventBus, Trigger, WatchdogEvent};
use lobster_core::error::Error;
use lobster_core::tenant::TenantStatus;
use lobster_core::time;
use lobster_runtime::drivers::net;
use lobster_runtime::lifecycle::{Quiet, TenantOps};

/// Cadence of the cron wake scan.
const CRON_TICK: Duration = Duration::from_secs(1);

/// First-seen-idle timestamps, shared between idle-loop ticks.
type IdleMarks = Arc<Mutex<HashMap<String, Instant>>>;

/// What an idle-loop probe concluded for one tenant.
#[derive(Debug, PartialEq, Eq)]
enum IdleVerdict {
    /// Connections active (or tenant unknown): clear any mark.
    Busy,
    /// Zero connections but not long enough yet.
    Marked,
    /// Zero connections sustained past the threshold.
    Suspend,
}

/// Update the idle mark for a tenant given a fresh connection count.
/// `None` means the agent was unreachable, which must not advance the
/// idle timer either way.
fn idle_verdict(
    marks: &IdleMarks,
    name: &str,
    connections: Option<u64>,
    now: Instant,
    threshold: Duration,
) -> IdleVerdict {
    let mut map = marks.lock().unwrap();
    match connections {
        Some(0) => {
            let first_seen = *map.entry(name.to_string()).or_insert(now);
            if now.duration_since(first_seen) >= threshold {
                IdleVerdict::Suspend
            } else {
                IdleVerdict::Marked
            }
        }
        Some(_) => {
            map.remove(name);
            IdleVerdict::Busy
        }
        None => {
            if map.contains_key(name) {
                IdleVerdict::Marked
            } else {
                IdleVerdict::Busy
            }
        }
    }
}

/// What the traffic loop should do about a suspended tenant's counter.
#[derive(Debug, PartialEq, Eq)]
enum TrafficVerdict {
    /// Counter grew: traffic arrived, wake the tenant.
    Resume,
    /// Counter went backwards (reset or wraparound): re-baseline only.
    Rebaseline,
    /// Nothing changed.
    Idle,
}

fn traffic_verdict(last_rx_bytes: u64, current: u64) -> TrafficVerdict {
    if current > last_rx_bytes {
        TrafficVerdict::Resume
    } else if current < last_rx_bytes {
        TrafficVerdict::Rebaseline
    } else {
        TrafficVerdict::Idle
    }
}

/// The watchdog: three timer loops and the event stream.
pub struct Watchdog {
    ops: Arc<TenantOps>,
    events: EventBus,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    idle_marks: IdleMarks,
}

impl Watchdog {
    pub fn new(ops: Arc<TenantOps>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ops,
            events: EventBus::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            idle_marks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start the idle, traffic, and cron loops.
    pub fn start(&self) {
        let cfg = self.ops.config().watchdog.clone();
        let mut tasks = self.tasks.lock().unwrap();

        tasks.push(tokio::spawn(idle_loop(
            self.ops.clone(),
            self.events.clone(),
            self.idle_marks.clone(),
            Duration::from_millis(cfg.interval_ms),
            Duration::from_millis(cfg.idle_threshold_ms),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(traffic_loop(
            self.ops.clone(),
            self.events.clone(),
            Duration::from_millis(cfg.traffic_poll_ms),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(cron_loop(
            self.ops.clone(),
            self.events.clone(),
            self.shutdown.subscribe(),
        )));
        info!("watchdog started");
    }

    /// Cancel the loops, refuse further triggers, and wait for in-flight
    /// operations to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        while self.ops.gate().in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("watchdog stopped");
    }
}

/// Run one tick body every `period` until shutdown flips.
async fn run_loop<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                // A dropped sender means the watchdog itself is gone.
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Idle loop: probe connection counts on active tenants and suspend the
/// ones idle past the threshold.
async fn idle_loop(
    ops: Arc<TenantOps>,
    events: EventBus,
    marks: IdleMarks,
    period: Duration,
    threshold: Duration,
    shutdown: watch::Receiver<bool>,
) {
    run_loop(period, shutdown, || {
        let ops = ops.clone();
        let events = events.clone();
        let marks = marks.clone();
        async move {
            let registry = match ops.store().load() {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "idle loop: registry load");
                    return;
                }
            };
            for tenant in &registry.tenants {
                if tenant.status != TenantStatus::Active {
                    marks.lock().unwrap().remove(&tenant.name);
                    continue;
                }
                let client =
                    lobster_runtime::drivers::vsock::VsockClient::for_tenant(ops.config(), tenant);
                let connections = client.get_active_connections().await.ok();
                let verdict = idle_verdict(
                    &marks,
                    &tenant.name,
                    connections,
                    Instant::now(),
                    threshold,
                );
                debug!(tenant = %tenant.name, ?connections, ?verdict, "idle probe");
                if verdict == IdleVerdict::Suspend {
                    spawn_suspend(ops.clone(), events.clone(), marks.clone(), tenant.name.clone());
                }
            }
        }
    })
    .await;
}

/// Traffic loop: resume suspended tenants whose tap rx counter grew.
async fn traffic_loop(
    ops: Arc<TenantOps>,
    events: EventBus,
    period: Duration,
    shutdown: watch::Receiver<bool>,
) {
    run_loop(period, shutdown, || {
        let ops = ops.clone();
        let events = events.clone();
        async move {
            let registry = match ops.store().load() {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "traffic loop: registry load");
                    return;
                }
            };
            for tenant in &registry.tenants {
                let Some(info) = &tenant.suspend_info else {
                    continue;
                };
                let current = match net::rx_bytes(&tenant.tap_dev) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(tenant = %tenant.name, error = %e, "traffic probe");
                        continue;
                    }
                };
                match traffic_verdict(info.last_rx_bytes, current) {
                    TrafficVerdict::Resume => {
                        spawn_resume(ops.clone(), events.clone(), tenant.name.clone(), Trigger::Traffic);
                    }
                    TrafficVerdict::Rebaseline => {
                        let name = tenant.name.clone();
                        let res = ops.store().mutate(|reg| {
                            if let Some(info) = &mut reg.get_mut(&name)?.suspend_info {
                                info.last_rx_bytes = current;
                            }
                            Ok(())
                        });
                        if let Err(e) = res {
                            warn!(tenant = %name, error = %e, "traffic rebaseline");
                        }
                    }
                    TrafficVerdict::Idle => {}
                }
            }
        }
    })
    .await;
}

/// Cron loop: fire scheduled wakes recorded at suspend time.
async fn cron_loop(ops: Arc<TenantOps>, events: EventBus, shutdown: watch::Receiver<bool>) {
    run_loop(CRON_TICK, shutdown, || {
        let ops = ops.clone();
        let events = events.clone();
        async move {
            let registry = match ops.store().load() {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "cron loop: registry load");
                    return;
                }
            };
            let now = time::now_ms();
            for tenant in &registry.tenants {
                let due = tenant
                    .suspend_info
                    .as_ref()
                    .and_then(|i| i.next_wake_at_ms)
                    .map(|at| at <= now)
                    .unwrap_or(false);
                if due {
                    spawn_resume(ops.clone(), events.clone(), tenant.name.clone(), Trigger::Cron);
                }
            }
        }
    })
    .await;
}

/// Suspend in a worker task. A busy tenant is dropped silently; the
/// next tick retries if still needed.
fn spawn_suspend(ops: Arc<TenantOps>, events: EventBus, marks: IdleMarks, name: String) {
    if ops.gate().is_busy(&name) {
        return;
    }
    tokio::spawn(async move {
        events.publish(WatchdogEvent::SuspendStart {
            tenant: name.clone(),
            trigger: Trigger::Idle,
        });
        match ops.suspend(&name, &Quiet).await {
            Ok(tenant) => {
                marks.lock().unwrap().remove(&name);
                events.publish(WatchdogEvent::SuspendComplete {
                    tenant: name,
                    next_wake_at_ms: tenant.suspend_info.and_then(|i| i.next_wake_at_ms),
                });
            }
            Err(Error::OperationInFlight(_)) => {
                debug!(tenant = %name, "suspend trigger lost the race, dropped");
            }
            Err(e) => {
                warn!(tenant = %name, error = %e, "auto-suspend failed");
                events.publish(WatchdogEvent::SuspendFailed {
                    tenant: name,
                    error: e.to_string(),
                });
            }
        }
    });
}

/// Resume in a worker task, same overlap rules as suspend.
fn spawn_resume(ops: Arc<TenantOps>, events: EventBus, name: String, trigger: Trigger) {
    if ops.gate().is_busy(&name) {
        return;
    }
    tokio::spawn(async move {
        events.publish(WatchdogEvent::ResumeStart {
            tenant: name.clone(),
            trigger,
        });
        match ops.resume(&name, &Quiet).await {
            Ok(tenant) => {
                events.publish(WatchdogEvent::ResumeComplete {
                    tenant: name,
                    vm_pid: tenant.vm_pid.unwrap_or_default(),
                });
            }
            Err(Error::OperationInFlight(_)) => {
                debug!(tenant = %name, trigger = %trigger, "resume trigger lost the race, dropped");
            }
            Err(e) => {
                warn!(tenant = %name, error = %e, "auto-resume failed");
                events.publish(WatchdogEvent::ResumeFailed {
                    tenant: name,
                    trigger,
                    error: e.to_string(),
                });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobster_core::config::LobsterdConfig;
    use lobster_core::registry::RegistryStore;
    use lobster_runtime::drivers::proxy::testing::MemProxy;

    fn test_ops(dir: &std::path::Path) -> Arc<TenantOps> {
        let mut config = LobsterdConfig::default();
        config.watchdog.interval_ms = 20;
        config.watchdog.traffic_poll_ms = 20;
        config.watchdog.idle_threshold_ms = 50;
        let store = RegistryStore::new(dir, 10000, 9000);
        Arc::new(TenantOps::new(config, store, Arc::new(MemProxy::default())))
    }

    fn marks() -> IdleMarks {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn test_idle_verdict_sustained_zero_suspends() {
        let m = marks();
        let threshold = Duration::from_millis(60_000);
        let t0 = Instant::now();
        assert_eq!(
            idle_verdict(&m, "alice", Some(0), t0, threshold),
            IdleVerdict::Marked
        );
        // Still inside the threshold.
        assert_eq!(
            idle_verdict(&m, "alice", Some(0), t0 + Duration::from_millis(59_999), threshold),
            IdleVerdict::Marked
        );
        assert_eq!(
            idle_verdict(&m, "alice", Some(0), t0 + Duration::from_millis(60_000), threshold),
            IdleVerdict::Suspend
        );
    }

    #[tokio::test]
    async fn test_idle_verdict_activity_clears_mark() {
        let m = marks();
        let threshold = Duration::from_millis(100);
        let t0 = Instant::now();
        idle_verdict(&m, "alice", Some(0), t0, threshold);
        assert_eq!(
            idle_verdict(&m, "alice", Some(3), t0 + Duration::from_millis(50), threshold),
            IdleVerdict::Busy
        );
        // The clock restarts from the next zero reading.
        assert_eq!(
            idle_verdict(&m, "alice", Some(0), t0 + Duration::from_millis(200), threshold),
            IdleVerdict::Marked
        );
    }

    #[tokio::test]
    async fn test_idle_verdict_unreachable_agent_freezes_timer() {
        let m = marks();
        let threshold = Duration::from_millis(100);
        let t0 = Instant::now();
        // Unreachable with no mark: nothing starts.
        assert_eq!(
            idle_verdict(&m, "alice", None, t0, threshold),
            IdleVerdict::Busy
        );
        assert!(m.lock().unwrap().is_empty());
        // Unreachable with a mark: mark stays, no suspend.
        idle_verdict(&m, "alice", Some(0), t0, threshold);
        assert_eq!(
            idle_verdict(&m, "alice", None, t0 + Duration::from_secs(10), threshold),
            IdleVerdict::Marked
        );
        assert!(m.lock().unwrap().contains_key("alice"));
    }

    #[test]
    fn test_traffic_verdict() {
        assert_eq!(traffic_verdict(100, 101), TrafficVerdict::Resume);
        assert_eq!(traffic_verdict(100, 100), TrafficVerdict::Idle);
        // Counter reset or wraparound: never a resume, only a new baseline.
        assert_eq!(traffic_verdict(100, 5), TrafficVerdict::Rebaseline);
        assert_eq!(traffic_verdict(u64::MAX, 0), TrafficVerdict::Rebaseline);
    }

    #[tokio::test]
    async fn test_start_stop_with_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let wd = Watchdog::new(test_ops(dir.path()));
        wd.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        wd.stop().await;
    }

    #[tokio::test]
    async fn test_busy_tenant_trigger_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let ops = test_ops(dir.path());
        let events = EventBus::new();
        let mut rx = events.subscribe();

        let _held = ops.gate().begin("alice").unwrap();
        spawn_suspend(ops.clone(), events.clone(), marks(), "alice".to_string());
        spawn_resume(ops, events, "alice".to_string(), Trigger::Traffic);

        // No start/failed events may surface for a gated tenant.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let ops = test_ops(dir.path());
        let wd = Watchdog::new(ops.clone());
        wd.start();

        let guard = ops.gate().begin("alice").unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(guard);
        });

        let start = std::time::Instant::now();
        wd.stop().await;
        assert!(start.elapsed() >= Duration::from_millis(140));
        release.await.unwrap();
    }
}
