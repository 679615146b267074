//! Admission control for uploads.
//!
//! An upload may start once it holds a global permit, a permit for its
//! owner and a memory reservation sized from its declared length. The three
//! are taken together and released together through [`AdmissionTicket`].

use crate::memory::MemoryMonitor;
use drivex_core::{OwnerId, reservation_for_size};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Why an upload was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionDenied {
    #[error("global upload limit of {limit} reached")]
    GlobalLimit { limit: usize },

    #[error("per-user upload limit of {limit} reached")]
    UserLimit { limit: usize },

    #[error("not enough memory to reserve {requested} bytes")]
    Memory { requested: u64 },
}

impl AdmissionDenied {
    /// Label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::GlobalLimit { .. } => "global_limit",
            Self::UserLimit { .. } => "user_limit",
            Self::Memory { .. } => "memory",
        }
    }
}

#[derive(Default)]
struct Counters {
    global: usize,
    per_user: HashMap<OwnerId, usize>,
}

impl Counters {
    fn take(&mut self, owner: &OwnerId) {
        self.global += 1;
        *self.per_user.entry(owner.clone()).or_insert(0) += 1;
    }

    fn give_back(&mut self, owner: &OwnerId) {
        self.global = self.global.saturating_sub(1);
        if let Some(count) = self.per_user.get_mut(owner) {
            *count -= 1;
            if *count == 0 {
                self.per_user.remove(owner);
            }
        }
    }
}

struct ManagerInner {
    global_max: usize,
    per_user_max: usize,
    memory: Arc<MemoryMonitor>,
    counters: Mutex<Counters>,
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, owner: &OwnerId, reservation: u64) {
        self.memory.release(reservation);
        let active = {
            let mut counters = self.lock();
            counters.give_back(owner);
            counters.global
        };
        crate::metrics::ACTIVE_UPLOADS.set(active as i64);
    }
}

/// Occupancy figures for operators.
#[derive(Clone, Debug, Serialize)]
pub struct ConcurrencySnapshot {
    pub global_active: usize,
    pub global_max: usize,
    pub per_user_max: usize,
    pub per_user: BTreeMap<String, usize>,
}

/// Gate enforcing global, per-user and memory limits.
#[derive(Clone)]
pub struct UploadConcurrencyManager {
    inner: Arc<ManagerInner>,
}

impl UploadConcurrencyManager {
    pub fn new(global_max: usize, per_user_max: usize, memory: Arc<MemoryMonitor>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                global_max,
                per_user_max,
                memory,
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// Admit an upload of `declared_size` bytes for `owner`, or say why not.
    pub fn try_admit(
        &self,
        owner: &OwnerId,
        declared_size: u64,
    ) -> Result<AdmissionTicket, AdmissionDenied> {
        {
            let mut counters = self.inner.lock();
            if counters.global >= self.inner.global_max {
                return Err(AdmissionDenied::GlobalLimit {
                    limit: self.inner.global_max,
                });
            }
            let mine = counters.per_user.get(owner).copied().unwrap_or(0);
            if mine >= self.inner.per_user_max {
                return Err(AdmissionDenied::UserLimit {
                    limit: self.inner.per_user_max,
                });
            }
            counters.take(owner);
        }

        let reservation = reservation_for_size(declared_size);
        if !self.inner.memory.try_reserve(reservation) {
            self.inner.lock().give_back(owner);
            return Err(AdmissionDenied::Memory {
                requested: reservation,
            });
        }

        crate::metrics::ACTIVE_UPLOADS.set(self.inner.lock().global as i64);
        Ok(AdmissionTicket {
            owner: owner.clone(),
            reservation,
            released: false,
            inner: self.inner.clone(),
        })
    }

    /// Release a ticket. Returns false if it was already released.
    pub fn release(&self, ticket: &mut AdmissionTicket) -> bool {
        ticket.release()
    }

    pub fn global_active(&self) -> usize {
        self.inner.lock().global
    }

    pub fn active_for(&self, owner: &OwnerId) -> usize {
        self.inner.lock().per_user.get(owner).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let counters = self.inner.lock();
        ConcurrencySnapshot {
            global_active: counters.global,
            global_max: self.inner.global_max,
            per_user_max: self.inner.per_user_max,
            per_user: counters
                .per_user
                .iter()
                .map(|(owner, count)| (owner.as_str().to_string(), *count))
                .collect(),
        }
    }
}

/// Permits plus memory reservation held by one admitted upload.
///
/// Released exactly once, either explicitly or on drop.
#[must_use = "dropping the ticket releases the admission immediately"]
pub struct AdmissionTicket {
    owner: OwnerId,
    reservation: u64,
    released: bool,
    inner: Arc<ManagerInner>,
}

impl AdmissionTicket {
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Reserved memory, in bytes.
    pub fn reservation(&self) -> u64 {
        self.reservation
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release memory, then both permits. Returns false if already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            tracing::warn!(owner_id = %self.owner, "admission ticket released twice");
            return false;
        }
        self.released = true;
        self.inner.release(&self.owner, self.reservation);
        true
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(&self.owner, self.reservation);
        }
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("owner", &self.owner)
            .field("reservation", &self.reservation)
            .field("released", &self.released)
            .finish()
    }
}
