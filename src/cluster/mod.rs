//! Cluster-mode collaborators: shared membership records and the broadcast
//! replication broker, each with a process-local and a shared-backend
//! implementation.

pub mod backend;
pub mod broker;
pub mod store;

pub use backend::{BackendHandler, BackendSubscription, MemoryBackend, SharedBackend};
pub use broker::{
    namespace_topic, room_topic, Broker, BrokerHandler, BrokerSubscription, InProcessBroker,
    SharedBroker,
};
pub use store::{ClusterMembershipRecord, ClusterStateStore, LocalStateStore, SharedStateStore};

/// Escapes the `:` delimiter inside one key/topic segment. Room names come
/// from clients, so a name like `general:vip` must not fold into another
/// room's keyspace.
pub(crate) fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace(':', "%3A")
}

pub(crate) fn unescape_segment(segment: &str) -> String {
    segment.replace("%3A", ":").replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_escaping_round_trips() {
        for segment in ["general", "general:vip", "50%:off", "%3A", ""] {
            let escaped = escape_segment(segment);
            assert!(!escaped.contains(':'), "{:?} still has a delimiter", escaped);
            assert_eq!(unescape_segment(&escaped), segment);
        }
    }
}
