//! Monthly quota decisions and per-user reservations

use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::Mutex;

use crate::db::{Database, UserRecord};
use crate::error::TransferError;

const GIB: u64 = 1024 * 1024 * 1024;

/// Byte ceiling of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanLimit {
    Bytes(u64),
    Unlimited,
}

impl PlanLimit {
    /// Bytes left before the ceiling, `None` for unlimited plans
    pub fn remaining(&self, used: u64) -> Option<u64> {
        match self {
            PlanLimit::Bytes(limit) => Some(limit.saturating_sub(used)),
            PlanLimit::Unlimited => None,
        }
    }
}

/// Named plans and their monthly ceilings
#[derive(Debug, Clone)]
pub struct PlanTable {
    plans: Vec<(String, PlanLimit)>,
}

impl Default for PlanTable {
    fn default() -> Self {
        Self::new(vec![
            ("free".to_string(), PlanLimit::Bytes(GIB)),
            ("basic".to_string(), PlanLimit::Bytes(5 * GIB)),
            ("pro".to_string(), PlanLimit::Bytes(20 * GIB)),
            ("premium".to_string(), PlanLimit::Bytes(50 * GIB)),
            ("unlimited".to_string(), PlanLimit::Unlimited),
        ])
    }
}

impl PlanTable {
    pub fn new(plans: Vec<(String, PlanLimit)>) -> Self {
        Self { plans }
    }

    pub fn limit(&self, name: &str) -> Option<PlanLimit> {
        self.plans
            .iter()
            .find(|(plan, _)| plan == name)
            .map(|(_, limit)| *limit)
    }

    /// Limit for a stored plan name; unknown names get the first (smallest) plan
    pub fn resolve(&self, name: &str) -> PlanLimit {
        self.limit(name).unwrap_or_else(|| {
            debug!("plan_unknown: {} falling back to default", name);
            self.plans
                .first()
                .map(|(_, limit)| *limit)
                .unwrap_or(PlanLimit::Bytes(0))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plans.iter().map(|(name, _)| name.as_str())
    }
}

/// A user's consumption against their plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub used: u64,
    pub limit: PlanLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny { shortfall: u64 },
}

/// Allow iff `used + size <= limit`; unlimited plans always allow
pub fn check(usage: &Usage, size: u64) -> QuotaDecision {
    match usage.limit {
        PlanLimit::Unlimited => QuotaDecision::Allow,
        PlanLimit::Bytes(limit) => {
            let needed = usage.used.saturating_add(size);
            if needed <= limit {
                QuotaDecision::Allow
            } else {
                QuotaDecision::Deny {
                    shortfall: needed - limit,
                }
            }
        }
    }
}

#[derive(Default)]
struct GateState {
    user_locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
    reserved: StdMutex<HashMap<i64, u64>>,
}

fn relock<'a, T>(result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl GateState {
    fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        relock(self.user_locks.lock())
            .entry(user_id)
            .or_default()
            .clone()
    }

    /// Drop the user's lock entry once no transfer holds a handle to it
    fn prune_lock(&self, user_id: i64) {
        let mut locks = relock(self.user_locks.lock());
        if locks
            .get(&user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&user_id);
        }
    }

    fn reserved(&self, user_id: i64) -> u64 {
        relock(self.reserved.lock())
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, user_id: i64, bytes: u64) {
        let mut reserved = relock(self.reserved.lock());
        if let Some(current) = reserved.get_mut(&user_id) {
            *current = current.saturating_sub(bytes);
            if *current == 0 {
                reserved.remove(&user_id);
            }
        }
    }
}

/// Quota decisions plus an in-flight reservation ledger.
///
/// `reserve` and `commit` for the same user run under that user's lock, so two
/// concurrent transfers cannot both pass the check and jointly exceed the plan.
/// Different users never contend.
#[derive(Clone)]
pub struct QuotaGate {
    plans: PlanTable,
    state: Arc<GateState>,
}

impl QuotaGate {
    pub fn new(plans: PlanTable) -> Self {
        Self {
            plans,
            state: Arc::new(GateState::default()),
        }
    }

    pub fn plans(&self) -> &PlanTable {
        &self.plans
    }

    /// Usage of a stored user, counting bytes reserved by in-flight transfers
    pub fn usage_of(&self, user: &UserRecord) -> Usage {
        Usage {
            used: user
                .monthly_used
                .saturating_add(self.state.reserved(user.user_id)),
            limit: self.plans.resolve(&user.plan),
        }
    }

    /// Check a transfer of `size` bytes and hold the bytes until commit or drop.
    ///
    /// An unknown size (0) on a limited plan holds the whole remaining budget
    /// and the reservation carries it as a download cap.
    pub async fn reserve(
        &self,
        db: &Database,
        user_id: i64,
        size: u64,
    ) -> Result<Reservation, TransferError> {
        let lock = self.state.user_lock(user_id);
        let result = {
            let _guard = lock.lock().await;
            self.reserve_locked(db, user_id, size).await
        };
        drop(lock);
        self.state.prune_lock(user_id);
        result
    }

    async fn reserve_locked(
        &self,
        db: &Database,
        user_id: i64,
        size: u64,
    ) -> Result<Reservation, TransferError> {
        let user = db
            .get_user(user_id)
            .await
            .map_err(TransferError::store)?
            .ok_or(TransferError::UnknownUser)?;
        let usage = self.usage_of(&user);

        match check(&usage, size) {
            QuotaDecision::Allow => {
                let (bytes, cap) = match usage.limit {
                    PlanLimit::Bytes(_) if size == 0 => {
                        let remaining = usage.limit.remaining(usage.used).unwrap_or(0);
                        (remaining, Some(remaining))
                    }
                    _ => (size, None),
                };
                *relock(self.state.reserved.lock())
                    .entry(user_id)
                    .or_insert(0) += bytes;
                debug!("quota_reserve: {} bytes={} cap={:?}", user_id, bytes, cap);
                Ok(Reservation {
                    state: self.state.clone(),
                    user_id,
                    bytes,
                    cap,
                })
            }
            QuotaDecision::Deny { shortfall } => Err(TransferError::QuotaExceeded {
                shortfall,
                remaining: usage.limit.remaining(usage.used).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Add `committed_size` to the user's monthly usage and retire the reservation.
    ///
    /// Consumes the reservation, so one transfer can commit at most once.
    pub async fn commit(
        &self,
        db: &Database,
        reservation: Reservation,
        committed_size: u64,
    ) -> Result<(), TransferError> {
        let user_id = reservation.user_id;
        let lock = self.state.user_lock(user_id);
        let result = {
            let _guard = lock.lock().await;
            let added = db.add_usage(user_id, committed_size).await;
            drop(reservation);
            added
        };
        drop(lock);
        self.state.prune_lock(user_id);

        result.map_err(TransferError::store)?;
        info!("quota_commit: {} bytes={}", user_id, committed_size);
        Ok(())
    }
}

/// Bytes held for an in-flight transfer; released on drop
#[derive(Debug)]
pub struct Reservation {
    state: Arc<GateState>,
    user_id: i64,
    bytes: u64,
    cap: Option<u64>,
}

impl Reservation {
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Most bytes an unknown-size transfer may pull, `None` when uncapped
    pub fn download_cap(&self) -> Option<u64> {
        self.cap
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.state.release(self.user_id, self.bytes);
    }
}

impl std::fmt::Debug for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateState").finish_non_exhaustive()
    }
}
