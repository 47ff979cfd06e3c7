//! Cluster-aware bulk loader: row sources, the memory governor, and the
//! two-pass loader itself.

pub mod bulk;
pub mod governor;
pub mod source;

pub use bulk::{BulkLoader, LoaderSettings};
pub use governor::{MemoryGovernor, MemoryProbe, Pressure, ProcessMemoryProbe};
pub use source::{GroupRow, MemorySource, RowSource, ShardFilter, SqliteSource, TemplateRow};
