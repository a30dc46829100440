pub mod api;
pub mod config;
pub mod database;
pub mod flags;
pub mod metrics_consts;
pub mod metrics_utils;
pub mod redis;
pub mod router;
pub mod server;

// Test helpers are used by unit tests and by the integration tests under tests/.
pub mod test_utils;
