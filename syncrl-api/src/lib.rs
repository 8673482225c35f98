// configuration, builders, hooks and logging setup on top of the core and the agents
pub mod builders;
pub mod config;
pub mod hooks;
pub mod logging;

#[cfg(feature = "test-utils")]
pub mod test_utils;
