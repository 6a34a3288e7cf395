pub mod config;
pub mod database;
pub mod deal_finder;
pub mod enricher;
pub mod fetcher;
pub mod models;
pub mod parser;
pub mod telegram;
pub mod threshold;

pub use deal_finder::{DealFinder, RunSummary};
