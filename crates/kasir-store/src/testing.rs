// ABOUTME: Test utilities for kasir, including a fault-injecting store wrapper.
// ABOUTME: Used in tests to simulate quota refusals, failing reads and writes, and corrupted read-back.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::memory::MemoryStore;
use crate::store::{KvStore, StoreError};

/// How an injected write failure presents itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Quota,
    Unavailable,
}

impl Fault {
    fn to_error(self, key: &str) -> StoreError {
        match self {
            Fault::Quota => StoreError::QuotaExceeded {
                key: key.to_owned(),
                needed: 0,
                available: 0,
            },
            Fault::Unavailable => StoreError::Unavailable(format!("injected failure writing {key}")),
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    /// Remaining failing writes per key.
    set_faults: HashMap<String, (Fault, usize)>,
    /// Remaining failing writes for any key.
    any_set_faults: Option<(Fault, usize)>,
    /// Remaining reads per key that return altered content.
    corrupt_reads: HashMap<String, usize>,
    /// Per key: reads to let through first, then reads to refuse.
    get_faults: HashMap<String, (usize, usize)>,
    set_calls: HashMap<String, usize>,
}

/// A [`MemoryStore`] wrapper whose writes and reads can be scripted to fail.
///
/// Faults are consumed as they fire, so a plan of "fail twice" lets the third
/// attempt through. Use `usize::MAX` for a fault that never clears.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    plan: Mutex<FaultPlan>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` writes to `key`.
    pub fn fail_sets(&self, key: &str, fault: Fault, times: usize) {
        self.plan().set_faults.insert(key.to_owned(), (fault, times));
    }

    /// Fail the next `times` writes to any key.
    pub fn fail_all_sets(&self, fault: Fault, times: usize) {
        self.plan().any_set_faults = Some((fault, times));
    }

    /// Make the next `times` reads of `key` return a value different from what was stored.
    pub fn corrupt_reads(&self, key: &str, times: usize) {
        self.plan().corrupt_reads.insert(key.to_owned(), times);
    }

    /// Let the next `skip` reads of `key` through, then refuse the following `times`.
    pub fn fail_gets(&self, key: &str, skip: usize, times: usize) {
        self.plan().get_faults.insert(key.to_owned(), (skip, times));
    }

    /// Remove every scripted fault.
    pub fn heal(&self) {
        let mut plan = self.plan();
        plan.set_faults.clear();
        plan.any_set_faults = None;
        plan.corrupt_reads.clear();
        plan.get_faults.clear();
    }

    /// How many times `set` was called for `key`, including refused calls.
    pub fn set_calls(&self, key: &str) -> usize {
        self.plan().set_calls.get(key).copied().unwrap_or(0)
    }

    /// Direct access to the underlying store, bypassing faults.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn plan(&self) -> MutexGuard<'_, FaultPlan> {
        self.plan.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn consume(slot: &mut (Fault, usize)) -> Option<Fault> {
    if slot.1 == 0 {
        return None;
    }
    if slot.1 != usize::MAX {
        slot.1 -= 1;
    }
    Some(slot.0)
}

impl KvStore for FaultyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut plan = self.plan();
        if let Some((skip, times)) = plan.get_faults.get_mut(key) {
            if *skip > 0 {
                *skip -= 1;
            } else if *times > 0 {
                if *times != usize::MAX {
                    *times -= 1;
                }
                return Err(StoreError::Unavailable(format!("injected failure reading {key}")));
            }
        }
        let value = self.inner.get(key)?;
        if let Some(remaining) = plan.corrupt_reads.get_mut(key)
            && *remaining > 0
        {
            if *remaining != usize::MAX {
                *remaining -= 1;
            }
            return Ok(Some(format!("{}~corrupted", value.unwrap_or_default())));
        }
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut plan = self.plan();
            *plan.set_calls.entry(key.to_owned()).or_insert(0) += 1;
            if let Some(slot) = plan.any_set_faults.as_mut()
                && let Some(fault) = consume(slot)
            {
                return Err(fault.to_error(key));
            }
            if let Some(slot) = plan.set_faults.get_mut(key)
                && let Some(fault) = consume(slot)
            {
                return Err(fault.to_error(key));
            }
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.keys()
    }

    fn usage_bytes(&self) -> Result<usize, StoreError> {
        self.inner.usage_bytes()
    }
}
