pub mod api;
pub mod errors;
pub mod group;
#[cfg(test)]
mod group_test;
pub mod group_manager;
pub mod http_server_handler;
pub mod relay_factory;
pub mod server_manager;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const API_VERSION: &str = "v1";

pub(crate) const RELAY_PUSH_TIMEOUT_MS: u64 = 10_000;
pub(crate) const RELAY_PUSH_WRITE_AV_TIMEOUT_MS: u64 = 0;
pub(crate) const RELAY_PUSH_WRITE_CHAN_SIZE: usize = 512;
pub(crate) const RELAY_PULL_TIMEOUT_MS: u64 = 10_000;
