#![allow(clippy::result_large_err)]
// Library entrypoint for the service binary and integration tests.
pub mod core;
pub mod services;
pub mod storage;

pub use self::core::{config, error, shutdown};
pub use services::maintenance;
