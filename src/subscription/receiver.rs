//! Per-subscription receiver state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use tokio_util::sync::CancellationToken;

use crate::domain::{SubscriptionClientHandle, SubscriptionEndpoint};
use crate::locks::{lock_ignore_poison, read_ignore_poison, write_ignore_poison};

/// Lifecycle of a subscription as seen by its manager.
///
/// `Absent → Creating → Active → Cancelling → Deleted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not registered with this bus.
    Absent,
    /// Provisioning on the broker is in progress.
    Creating,
    /// The receive loop is running.
    Active,
    /// Cancellation was requested; waiting for the loop to unwind.
    Cancelling,
    /// The loop has stopped and the broker-side subscription was deleted.
    Deleted,
}

/// State shared between a subscription's manager and its receive loop.
///
/// The manager owns it; the loop observes cancellation through it and
/// reports completion back.
#[derive(Debug)]
pub(crate) struct ReceiverState {
    pub(crate) endpoint: SubscriptionEndpoint,
    // Replaced when the subscription is recreated
    client: RwLock<SubscriptionClientHandle>,
    cancel: CancellationToken,
    loop_completed: AtomicBool,
    state: Mutex<SubscriptionState>,
}

impl ReceiverState {
    pub(crate) fn new(endpoint: SubscriptionEndpoint, client: SubscriptionClientHandle) -> Self {
        // ---
        Self {
            endpoint,
            client: RwLock::new(client),
            cancel: CancellationToken::new(),
            loop_completed: AtomicBool::new(false),
            state: Mutex::new(SubscriptionState::Active),
        }
    }

    /// The receiver currently attached to the subscription.
    pub(crate) fn client(&self) -> SubscriptionClientHandle {
        read_ignore_poison(&self.client).clone()
    }

    pub(crate) fn replace_client(&self, client: SubscriptionClientHandle) {
        *write_ignore_poison(&self.client) = client;
    }

    pub(crate) fn request_cancel(&self) {
        self.set_state(SubscriptionState::Cancelling);
        self.cancel.cancel();
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token the loop selects on while idle.
    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn mark_loop_completed(&self) {
        self.loop_completed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_loop_completed(&self) -> bool {
        self.loop_completed.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *lock_ignore_poison(&self.state)
    }

    pub(crate) fn set_state(&self, state: SubscriptionState) {
        *lock_ignore_poison(&self.state) = state;
    }

    pub(crate) fn subscription_name(&self) -> &str {
        &self.endpoint.subscription_name
    }
}
