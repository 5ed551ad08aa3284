// lobster-watchdog: keeps the fleet right-sized without operator input.
//
// Three loops run concurrently: idle detection (connection counts via
// the guest agent), traffic detection (tap rx_bytes on suspended
// tenants), and cron wakes. All suspend/resume work funnels through
// the lifecycle engine's per-tenant gate, so overlapping triggers
// collapse to one operation.

pub mod events;
pub mod watchdog;

pub use events::{EventBus, Trigger, WatchdogEvent};
pub use watchdog::Watchdog;
