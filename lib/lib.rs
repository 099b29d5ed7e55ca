pub mod build_info;
pub mod cli;
pub mod command;
pub mod config;
pub mod db;
pub mod logging;
pub mod reconcile;
pub mod record;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod store;
