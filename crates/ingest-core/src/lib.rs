pub mod credentials;
pub mod format;

pub use credentials::Credentials;
pub use format::{FileFormat, FileFormats};

/// Protocol version this orchestrator speaks. Injected into every request
/// payload and checked against the manifest's declared version range.
pub const PROTOCOL_VERSION: i32 = 34;

/// Minimum manifest `version` this orchestrator will accept.
pub const MIN_SUPPORTED_MANIFEST_VERSION: i32 = 1;

/// Maximum number of times a contribution load failure, or a transient
/// server-classified error, is retried before being treated as fatal.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
