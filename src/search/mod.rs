//! Top-N scatter-gather search.

pub mod aggregator;
pub mod peer;
pub mod scan;
pub mod topn;

pub use aggregator::SearchAggregator;
pub use peer::{PeerClient, ScanResponse};
pub use scan::{scan_partition, PreparedQuery, ScanParams, ScanStats};
pub use topn::{merge_distinct, BoundedTopN};
