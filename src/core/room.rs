//! Room bookkeeping
//!
//! A Room object exists only while it has local members; membership counts
//! live in the adapter, never here. The broker subscription it owns is the
//! room's cross-process inbox and must be torn down before the object is
//! discarded.

use crate::cluster::BrokerSubscription;

pub struct Room {
    subscription: Option<BrokerSubscription>,
}

impl Room {
    pub fn new(subscription: BrokerSubscription) -> Self {
        Self {
            subscription: Some(subscription),
        }
    }

    /// Detaches the broker subscription for teardown
    pub fn take_subscription(&mut self) -> Option<BrokerSubscription> {
        self.subscription.take()
    }
}
