use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    // Validation errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid feature length: expected {expected} bytes, got {actual}")]
    InvalidFeatureLength { expected: usize, actual: usize },

    #[error("validation error: {0}")]
    Validation(String),

    // Search errors
    #[error("partition {partition} unavailable after {attempts} attempts: {reason}")]
    PartitionUnavailable {
        partition: String,
        attempts: usize,
        reason: String,
    },

    #[error("search concurrency limit reached, try again later")]
    SearchConcurrencyExhausted,

    #[error("peer {node_id} request failed: {reason}")]
    Peer { node_id: String, reason: String },

    // Load errors
    #[error("load row rejected ({reason}): {row}")]
    LoadRowRejected { row: String, reason: String },

    #[error("backing store error: {0}")]
    Source(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // Coordination errors
    #[error("lock {name} not acquired within {waited_secs}s")]
    LockTimeout { name: String, waited_secs: u64 },

    #[error("cluster not stable: {0}")]
    ClusterNotStable(String),

    #[error("lease on {name} held by {holder}")]
    LeaseHeld { name: String, holder: String },

    #[error("lease expired for {name}")]
    LeaseExpired { name: String },

    #[error("fencing token stale for {name}: ours={our_token}, current={current_token}")]
    FencingTokenStale {
        name: String,
        our_token: u64,
        current_token: u64,
    },

    #[error("conditional write conflict on {key}")]
    CasConflict { key: String },

    // Storage errors
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("template not found: {id}")]
    TemplateNotFound { id: String },

    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("storage path error: {0}")]
    StoragePath(#[from] object_store::path::Error),

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GalleryError>;

impl GalleryError {
    pub fn status_code(&self) -> u16 {
        match self {
            GalleryError::NotFound { .. } | GalleryError::TemplateNotFound { .. } => 404,

            GalleryError::LeaseHeld { .. }
            | GalleryError::LeaseExpired { .. }
            | GalleryError::FencingTokenStale { .. }
            | GalleryError::CasConflict { .. }
            | GalleryError::LockTimeout { .. } => 409,

            GalleryError::InvalidQuery(_)
            | GalleryError::InvalidFeatureLength { .. }
            | GalleryError::Validation(_)
            | GalleryError::LoadRowRejected { .. } => 400,

            GalleryError::PartitionUnavailable { .. }
            | GalleryError::SearchConcurrencyExhausted => 503,

            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_status_codes() {
        assert_eq!(GalleryError::InvalidQuery("top_n".into()).status_code(), 400);
        assert_eq!(
            GalleryError::InvalidFeatureLength {
                expected: 512,
                actual: 3
            }
            .status_code(),
            400
        );
        assert_eq!(GalleryError::Validation("bad".into()).status_code(), 400);
    }

    #[test]
    fn test_not_found_status_code() {
        let err = GalleryError::TemplateNotFound { id: "t-1".into() };
        assert_eq!(err.status_code(), 404);
        let err = GalleryError::NotFound {
            key: "some/key".into(),
        };
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_coordination_status_codes() {
        let err = GalleryError::LeaseHeld {
            name: "load".into(),
            holder: "node-2".into(),
        };
        assert_eq!(err.status_code(), 409);

        let err = GalleryError::LockTimeout {
            name: "load".into(),
            waited_secs: 300,
        };
        assert_eq!(err.status_code(), 409);

        let err = GalleryError::FencingTokenStale {
            name: "store".into(),
            our_token: 1,
            current_token: 4,
        };
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_partition_unavailable_is_503() {
        let err = GalleryError::PartitionUnavailable {
            partition: "node:b".into(),
            attempts: 3,
            reason: "connection refused".into(),
        };
        assert_eq!(err.status_code(), 503);
        assert_eq!(GalleryError::SearchConcurrencyExhausted.status_code(), 503);
    }

    #[test]
    fn test_default_status_code() {
        assert_eq!(GalleryError::Config("missing".into()).status_code(), 500);
        assert_eq!(GalleryError::Source("closed".into()).status_code(), 500);
        assert_eq!(
            GalleryError::ClusterNotStable("1 of 3".into()).status_code(),
            500
        );
    }

    #[test]
    fn test_display_formatting() {
        let err = GalleryError::InvalidFeatureLength {
            expected: 512,
            actual: 511,
        };
        let msg = err.to_string();
        assert!(msg.contains("512"));
        assert!(msg.contains("511"));

        let err = GalleryError::FencingTokenStale {
            name: "store".into(),
            our_token: 111,
            current_token: 222,
        };
        let msg = err.to_string();
        assert!(msg.contains("111"));
        assert!(msg.contains("222"));
    }
}
