pub mod cache;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod lightgbm;
pub mod market_data;
pub mod models;
pub mod optimizer;
pub mod orchestrator;
pub mod param_utils;
pub mod performance;
pub mod pipeline;
pub mod scorer;
pub mod signals;
pub mod trade_log;
pub mod trading_rules;

pub use config::BacktestConfig;
pub use error::{CacheError, ConfigError, DataError, SizingError, TaskError};
pub use models::{BacktestResult, Bar, BarSeries, TaskStatus};
pub use orchestrator::{BacktestTask, RunOrchestrator, RunReport};
pub use pipeline::{run_backtest, BacktestInputs};
