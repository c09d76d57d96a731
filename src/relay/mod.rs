//! The relay pipeline: poller, broadcaster and the pieces they share.

pub mod broadcaster;
pub mod delivery;
pub mod membership;
pub mod poller;
pub mod router;

use std::time::Duration;

/// Shortest scheduler period; `tokio::time::interval` rejects zero.
pub(crate) const MIN_TICK: Duration = Duration::from_millis(1);

#[cfg(test)]
pub(crate) mod testing;

pub use broadcaster::{BroadcastReport, Broadcaster, JobOutcome, spawn_broadcaster};
pub use delivery::{DeliveryEngine, DeliveryReport};
pub use membership::{MembershipChange, MembershipWatcher, spawn_membership_watcher};
pub use poller::{PollReport, Poller, spawn_poller};
pub use router::TopicRouter;
