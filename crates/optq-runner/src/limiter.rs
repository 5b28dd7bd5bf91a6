//! Fair admission limiter over the shared port pool.
//!
//! Callers `acquire` a [`Permit`] before every evaluation. The ledger lives behind a
//! mutex; waiters park on a [`Notify`] and every release or retirement wakes all of
//! them, because a freed slot or a shrinking active set can raise the allowance of
//! cases other than the one that changed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::ledger::{Capacity, LedgerSnapshot, ResourceLedger};

pub use crate::ledger::fair_allowance;

#[derive(Debug)]
pub struct FairLimiter {
    ledger: Mutex<ResourceLedger>,
    changed: Notify,
}

impl FairLimiter {
    pub fn new(capacity: Capacity) -> Arc<Self> {
        Arc::new(Self {
            ledger: Mutex::new(ResourceLedger::new(capacity)),
            changed: Notify::new(),
        })
    }

    // Every critical section leaves the ledger consistent, so a poisoned lock is
    // still safe to reuse.
    fn ledger(&self) -> MutexGuard<'_, ResourceLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> Capacity {
        self.ledger().capacity()
    }

    /// Admits a case into the active set. Fails fast with
    /// [`Error::AdmissionRejected`] when `max_cases` are already active.
    pub fn register(&self, case_id: &str) -> Result<()> {
        let mut ledger = self.ledger();
        if ledger.register(case_id) {
            debug!(case_id, active = ledger.active_len(), "case registered");
            Ok(())
        } else {
            Err(Error::AdmissionRejected {
                case_id: case_id.to_string(),
                active: ledger.active_len(),
                max_cases: ledger.capacity().max_cases,
            })
        }
    }

    /// Waits until the case may hold one more slot.
    ///
    /// Registers the case first if needed; a full active set is an immediate error,
    /// never a wait.
    pub async fn acquire(self: &Arc<Self>, case_id: &str) -> Result<Permit> {
        loop {
            // Arm the notification before checking so a release between the check
            // and the await is not lost.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire(case_id)? {
                return Ok(permit);
            }
            trace!(case_id, "waiting for a port");
            notified.await;
        }
    }

    /// Non-blocking variant of [`FairLimiter::acquire`].
    pub fn try_acquire(self: &Arc<Self>, case_id: &str) -> Result<Option<Permit>> {
        let mut ledger = self.ledger();
        if !ledger.is_active(case_id) && !ledger.register(case_id) {
            return Err(Error::AdmissionRejected {
                case_id: case_id.to_string(),
                active: ledger.active_len(),
                max_cases: ledger.capacity().max_cases,
            });
        }
        if !ledger.reserve(case_id) {
            return Ok(None);
        }
        trace!(
            case_id,
            in_flight = ledger.in_flight(case_id),
            global = ledger.global(),
            "port granted"
        );
        Ok(Some(Permit {
            limiter: Arc::clone(self),
            case_id: case_id.to_string(),
            released: false,
        }))
    }

    /// Returns one slot held by `case_id` and wakes every waiter.
    pub fn release(&self, case_id: &str) -> Result<()> {
        let result = self.ledger().free(case_id);
        if result.is_ok() {
            self.changed.notify_waiters();
        }
        result
    }

    /// Removes a drained case from the active set so the remaining cases' allowance
    /// grows. Returns false while the case still holds slots.
    pub fn retire(&self, case_id: &str) -> bool {
        let removed = self.ledger().unregister(case_id);
        if removed {
            debug!(case_id, "case retired");
            self.changed.notify_waiters();
        }
        removed
    }

    /// Retires the case as soon as its last slot comes back. Returns at once for
    /// a case that is not active.
    pub async fn retire_when_drained(&self, case_id: &str) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut ledger = self.ledger();
                if !ledger.is_active(case_id) {
                    return;
                }
                if ledger.unregister(case_id) {
                    drop(ledger);
                    debug!(case_id, "case retired");
                    self.changed.notify_waiters();
                    return;
                }
            }
            debug!(case_id, "retire waiting for outstanding slots");
            notified.await;
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger().snapshot()
    }
}

/// One held port. Dropping an unreleased permit frees the slot.
#[derive(Debug)]
pub struct Permit {
    limiter: Arc<FairLimiter>,
    case_id: String,
    released: bool,
}

impl Permit {
    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// Frees the slot, surfacing any ledger violation to the caller.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.limiter.release(&self.case_id)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.limiter.release(&self.case_id) {
                error!(case_id = %self.case_id, error = %err, "permit drop could not free its slot");
            }
        }
    }
}
