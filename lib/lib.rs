pub mod backfill;
pub mod build_info;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod event_engine;
pub mod logging;
pub mod marketplace;
pub mod scripts;
pub mod server;
pub mod state;
