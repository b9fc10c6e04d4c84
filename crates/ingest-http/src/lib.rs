pub mod balancer;
pub mod client;
pub mod error;
pub mod response;

pub use balancer::{LoadBalancedUrl, LoadBalancer, UnsupportedSchemeError};
pub use client::HttpClient;
pub use error::{ErrorExt, HttpError, ReplicationControllerError};
pub use response::{ContributionMonitor, ContributionState, DatabaseStatus, ResponseParser, TransactionState};
