pub mod audit;
pub mod credentials;
pub mod decision;
pub mod errors;
pub mod faces;
pub mod identity;
pub mod rate_limit;
pub mod secret_service;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{AppError, AppResult, ErrorClass};
pub use identity::Identity;
pub use service::{enrollment_status, HealthReport, StatusReport, VerificationService};
