//! Error types for OpenQuota

use thiserror::Error;

/// OpenQuota error type
///
/// These are configuration and integrity defects, fatal at load time.
/// Per-request outcomes (denials, exceeded limits) are returned as data.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Feature code registered twice in the catalog
    #[error("duplicate feature code: {0}")]
    DuplicateFeature(String),

    /// Package code registered twice in the catalog
    #[error("duplicate package code: {0}")]
    DuplicatePackage(String),

    /// A feature names a parent that is not in the catalog
    #[error("unknown parent feature {parent} on {feature}")]
    UnknownParent {
        /// Feature carrying the bad reference
        feature: String,
        /// The missing parent code
        parent: String,
    },

    /// A package grants a feature that is not in the catalog
    #[error("package {package} grants unknown feature {feature}")]
    UnknownFeatureInPackage {
        /// Package carrying the bad reference
        package: String,
        /// The missing feature code
        feature: String,
    },

    /// Parent-pool links form a cycle
    #[error("cyclic quota pool through feature {0}")]
    CyclicPool(String),

    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed catalog data file
    #[error("catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for OpenQuota
pub type EngineResult<T> = Result<T, EngineError>;
