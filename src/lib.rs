pub mod breaker;
pub mod broker;
pub mod commands;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub mod test_utils;
