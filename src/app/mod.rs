pub mod adb;
pub mod batch;
pub mod clock;
pub mod commands;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod followup;
pub mod logging;
pub mod models;
pub mod notify;
pub mod operations;
pub mod pool;
pub mod registry;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
