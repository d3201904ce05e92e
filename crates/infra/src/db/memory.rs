//! In-memory backend.
//!
//! Intended for tests and single-process dev runs. Each table sits behind its
//! own `RwLock`; queue tables hold [`Versioned`] rows so claims go through the
//! compare-and-swap path of the claim primitive. Operations touching two
//! tables always lock `print_jobs` before `orders`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use signpost_core::{EventId, JobId, Order, OrderId, PrintJobId, UserId};

use crate::checkout::types::CheckoutAttempt;
use crate::claim::Versioned;
use crate::error::StoreError;
use crate::jobs::types::AsyncJob;
use crate::print_queue::types::PrintJob;
use crate::webhooks::subscriptions::SubscriptionRecord;
use crate::webhooks::types::WebhookEvent;

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub(crate) orders: RwLock<BTreeMap<OrderId, Order>>,
    pub(crate) jobs: RwLock<BTreeMap<JobId, Versioned<AsyncJob>>>,
    pub(crate) print_jobs: RwLock<BTreeMap<PrintJobId, Versioned<PrintJob>>>,
    pub(crate) webhook_events: RwLock<HashMap<EventId, WebhookEvent>>,
    pub(crate) checkout_attempts: RwLock<HashMap<String, CheckoutAttempt>>,
    pub(crate) subscriptions: RwLock<HashMap<UserId, SubscriptionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read().map_err(|_| StoreError::poisoned())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write().map_err(|_| StoreError::poisoned())
}
