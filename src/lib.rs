// Core modules
pub mod config;
pub mod db;
pub mod engine;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod notifications;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::AppConfig;
pub use engine::{EngineSettings, PairOutcome, TradingEngine};
pub use models::*;
pub use strategy::Strategy;
