//! Failsafe mechanisms for calls to the issuing service

mod retry;

pub use retry::{RetryPolicy, Transient, with_retry};
