use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use lobster_core::error::{Error, Result};

/// Per-tenant mutual exclusion for lifecycle operations.
///
/// A second operation targeting a busy tenant fails with
/// `OperationInFlight` instead of queueing; the scheduler relies on
/// that to short-circuit overlapping triggers.
#[derive(Clone, Default)]
pub struct InFlightGate {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl InFlightGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the tenant's slot. The returned guard releases it on drop.
    pub fn begin(&self, name: &str) -> Result<InFlightGuard> {
        let mut busy = self.inner.lock().unwrap();
        if !busy.insert(name.to_string()) {
            return Err(Error::OperationInFlight(name.to_string()));
        }
        Ok(InFlightGuard {
            gate: self.clone(),
            name: name.to_string(),
        })
    }

    /// Whether any operation currently holds the tenant.
    pub fn is_busy(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains(name)
    }

    /// Number of operations in flight across all tenants.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

pub struct InFlightGuard {
    gate: InFlightGate,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gate.inner.lock().unwrap().remove(&self.name);
    }
}
