//! Per-identity sync serialization
//!
//! At most one sync runs per identity at a time, whichever path triggered it. A caller
//! that arrives while a sync for the same identity is in flight joins it and receives
//! the same result (request coalescing over a broadcast channel). If the in-flight
//! sync is dropped before finishing, joined callers get [`BillingError::SyncAbandoned`]
//! instead of waiting forever.
//!
//! The guard also owns the semaphore that bounds how many identities a sweep syncs
//! concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

type InFlight<T> = HashMap<Uuid, broadcast::Sender<BillingResult<T>>>;

pub struct SyncGuard<T> {
    in_flight: Arc<Mutex<InFlight<T>>>,
    sweep_permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl<T> SyncGuard<T>
where
    T: Clone + Send + 'static,
{
    /// `max_concurrency` bounds sweep fan-out; zero is treated as one
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            sweep_permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InFlight<T>> {
        // The map holds no invariants a panicking holder could break
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `work` for `identity_id`, or join the run already in flight
    pub async fn run<F, Fut>(&self, identity_id: Uuid, work: F) -> BillingResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let follower = {
            let mut in_flight = self.lock();
            if let Some(tx) = in_flight.get(&identity_id) {
                Some(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                in_flight.insert(identity_id, tx);
                None
            }
        };

        if let Some(mut rx) = follower {
            tracing::debug!(identity_id = %identity_id, "Joining in-flight sync");
            return match rx.recv().await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(identity_id = %identity_id, "In-flight sync was abandoned");
                    Err(BillingError::SyncAbandoned(identity_id))
                }
            };
        }

        let slot = LeaderSlot {
            in_flight: Arc::clone(&self.in_flight),
            identity_id,
            completed: false,
        };
        let result = work().await;
        slot.complete(result.clone());
        result
    }

    /// Wait for a sweep slot; excess identities queue here
    pub async fn acquire_sweep_permit(&self) -> BillingResult<OwnedSemaphorePermit> {
        Arc::clone(&self.sweep_permits)
            .acquire_owned()
            .await
            .map_err(|_| BillingError::Internal("sweep semaphore closed".to_string()))
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of identities with a sync currently in flight
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    pub fn is_in_flight(&self, identity_id: Uuid) -> bool {
        self.lock().contains_key(&identity_id)
    }
}

/// Owned by the leader while its work runs. Dropping it without `complete`
/// removes the entry, which closes the channel for any followers.
struct LeaderSlot<T> {
    in_flight: Arc<Mutex<InFlight<T>>>,
    identity_id: Uuid,
    completed: bool,
}

impl<T> LeaderSlot<T> {
    fn remove(&self) -> Option<broadcast::Sender<BillingResult<T>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.identity_id)
    }

    fn complete(mut self, result: BillingResult<T>) {
        self.completed = true;
        // Remove before sending so a caller arriving afterwards starts a fresh sync
        // instead of subscribing to a channel that already fired.
        if let Some(tx) = self.remove() {
            // No receivers is fine
            let _ = tx.send(result);
        }
    }
}

impl<T> Drop for LeaderSlot<T> {
    fn drop(&mut self) {
        if !self.completed {
            self.remove();
        }
    }
}
