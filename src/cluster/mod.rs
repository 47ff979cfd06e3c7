//! Cluster coordination: heartbeat-based membership and fenced leases, both
//! kept in the shared coordination store.

pub mod heartbeat;
pub mod lease;
pub mod membership;

pub use heartbeat::heartbeat_loop;
pub use lease::{DoneMarker, Lease, LeaseKeeper, LeaseManager};
pub use membership::{MemberRecord, MembershipRegistry, MembershipView};
