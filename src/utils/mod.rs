pub mod constants;
pub mod timeout;

pub use constants::*;
pub use timeout::{OperationTimedOut, timeout_and_retry, with_timeout};
