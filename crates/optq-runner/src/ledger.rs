//! In-flight accounting for the shared port pool.
//!
//! The ledger itself is plain data with no synchronisation; [`crate::limiter::FairLimiter`]
//! owns the only instance behind a mutex so that reserve/free/register/unregister are
//! atomic with respect to each other.
//!
//! Invariants held after every operation:
//! - `global == sum(per_case)`
//! - `global <= ports`
//! - `active.len() <= max_cases`

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::{Error, Result};

/// Static capacity knobs: `P`, `CaseCap` and `C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub ports: usize,
    pub case_cap: usize,
    pub max_cases: usize,
}

/// Fair allowance for one active case given `active` registered cases.
///
/// A case that is alone may use every port; once contention exists each case is
/// held to `min(case_cap, max(1, ports / k))`.
pub fn fair_allowance(ports: usize, case_cap: usize, active: usize) -> usize {
    let k = active.max(1);
    if k == 1 {
        return ports;
    }
    case_cap.min((ports / k).max(1))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub global_count: usize,
    pub per_case_counts: BTreeMap<String, usize>,
    pub active_set: BTreeSet<String>,
    pub allowance: usize,
}

#[derive(Debug)]
pub struct ResourceLedger {
    capacity: Capacity,
    global: usize,
    per_case: BTreeMap<String, usize>,
    active: BTreeSet<String>,
}

impl ResourceLedger {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            global: 0,
            per_case: BTreeMap::new(),
            active: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn is_active(&self, case_id: &str) -> bool {
        self.active.contains(case_id)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn in_flight(&self, case_id: &str) -> usize {
        self.per_case.get(case_id).copied().unwrap_or(0)
    }

    pub fn global(&self) -> usize {
        self.global
    }

    /// Current allowance for any active case.
    pub fn allowance(&self) -> usize {
        fair_allowance(
            self.capacity.ports,
            self.capacity.case_cap,
            self.active.len(),
        )
    }

    /// Adds the case to the active set. Already-active cases succeed unchanged.
    pub fn register(&mut self, case_id: &str) -> bool {
        if self.active.contains(case_id) {
            return true;
        }
        if self.active.len() >= self.capacity.max_cases {
            return false;
        }
        self.active.insert(case_id.to_string());
        true
    }

    /// Removes the case from the active set only once it has fully drained.
    pub fn unregister(&mut self, case_id: &str) -> bool {
        if self.in_flight(case_id) != 0 {
            return false;
        }
        self.per_case.remove(case_id);
        self.active.remove(case_id)
    }

    /// Takes one slot if both the global pool and the case's fair allowance permit it.
    pub fn reserve(&mut self, case_id: &str) -> bool {
        if self.global >= self.capacity.ports {
            return false;
        }
        if self.in_flight(case_id) >= self.allowance() {
            return false;
        }
        self.global += 1;
        *self.per_case.entry(case_id.to_string()).or_insert(0) += 1;
        true
    }

    /// Gives back one slot. Freeing a slot the case does not hold is a
    /// [`Error::LedgerInvariantViolation`] and leaves every count untouched.
    pub fn free(&mut self, case_id: &str) -> Result<()> {
        let held = self.in_flight(case_id);
        if held == 0 {
            return Err(Error::LedgerInvariantViolation {
                case_id: case_id.to_string(),
                detail: "free without a matching reservation".to_string(),
            });
        }
        if self.global == 0 {
            return Err(Error::LedgerInvariantViolation {
                case_id: case_id.to_string(),
                detail: format!("global count is zero while case holds {}", held),
            });
        }
        self.global -= 1;
        if held == 1 {
            self.per_case.remove(case_id);
        } else {
            self.per_case.insert(case_id.to_string(), held - 1);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            global_count: self.global,
            per_case_counts: self.per_case.clone(),
            active_set: self.active.clone(),
            allowance: self.allowance(),
        }
    }
}
