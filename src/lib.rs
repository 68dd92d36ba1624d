pub mod analytics;
pub mod api;
pub mod apns;
pub mod batcher;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dedup;
pub mod error;
pub mod expo;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod planner;
pub mod policy;
pub mod push;
pub mod rate_limiter;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod tasks;
pub mod validator;

#[cfg(test)]
mod testing;
