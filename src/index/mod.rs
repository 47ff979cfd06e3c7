//! Partitioned in-memory template index.
//!
//! `TemplateStore` owns a fixed set of partitions. Each template lives in
//! exactly one, chosen by hashing its id; each partition keeps a secondary
//! group index so scoped searches skip templates outside their groups.

pub mod gallery;
pub mod partition;

pub use gallery::{key_in_shard, partition_for, TemplateStore};
pub use partition::Partition;
