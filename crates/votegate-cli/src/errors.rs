pub use votegate_core::errors::{AppError, AppResult, ErrorClass};
