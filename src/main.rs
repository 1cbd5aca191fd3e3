use anyhow::Result;
use backtest_engine::commands::{backtest, clear_cache, export_snapshot, optimize, RunInputs};
use backtest_engine::config::Objective;
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;

const DEFAULT_TIMEFRAME: &str = "1h";

#[derive(Parser)]
#[command(name = "backtest-engine")]
#[command(about = "Offline multi-factor backtesting over OHLCV bars")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DataArgs {
    /// Bar files: CSV (timestamp,open,high,low,close,volume[,gap]) or .bin snapshots
    #[arg(long = "data", value_name = "PATH", required = true, num_args = 1..)]
    data: Vec<PathBuf>,
    /// Symbol for a single CSV file (defaults to the file stem)
    #[arg(long)]
    symbol: Option<String>,
    /// Timeframe label for CSV input
    #[arg(long, default_value = DEFAULT_TIMEFRAME)]
    timeframe: String,
    /// JSON config file; missing fields keep their defaults
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Parameter override in key=value form (camelCase keys), repeatable
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
    /// Precomputed model scores as JSON records
    #[arg(long, value_name = "PATH", conflicts_with = "model")]
    scores: Option<PathBuf>,
    /// LightGBM text model scored over trailing bar windows
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,
    /// Persist indicator tables in this directory
    #[arg(long = "cache-dir", value_name = "DIR")]
    cache_dir: Option<PathBuf>,
    /// Worker threads (defaults to the number of CPUs)
    #[arg(long)]
    workers: Option<usize>,
}

impl From<DataArgs> for RunInputs {
    fn from(args: DataArgs) -> Self {
        RunInputs {
            data: args.data,
            symbol: args.symbol,
            timeframe: args.timeframe,
            config: args.config,
            params: args.params,
            scores: args.scores,
            model: args.model,
            cache_dir: args.cache_dir,
            workers: args.workers,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest every input series with one configuration
    Backtest {
        #[command(flatten)]
        data: DataArgs,
        /// Write the run report as JSON
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Write every closed trade as CSV
        #[arg(long = "trades-csv", value_name = "PATH")]
        trades_csv: Option<PathBuf>,
    },
    /// Sweep a parameter grid and rank the variants
    Optimize {
        #[command(flatten)]
        data: DataArgs,
        /// Grid axis in key=v1,v2,... form, repeatable
        #[arg(long = "grid", value_name = "KEY=V1,V2", required = true)]
        grid: Vec<String>,
        /// Ranking objective: return or sharpe
        #[arg(long, default_value = "return")]
        objective: String,
        /// Demote variants whose average max drawdown exceeds this fraction
        #[arg(long = "max-drawdown")]
        max_drawdown: Option<f64>,
        /// Number of variants to print
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// Write the underlying run report as JSON
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Pack CSV bar files into a bincode snapshot
    ExportSnapshot {
        #[arg(long = "input", value_name = "PATH", required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long, default_value = DEFAULT_TIMEFRAME)]
        timeframe: String,
    },
    /// Remove every entry from an indicator cache directory
    ClearCache {
        #[arg(long = "cache-dir", value_name = "DIR")]
        cache_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    info!("Starting backtest engine. Simulated results are not indicative of live trading.");

    match command {
        Commands::Backtest {
            data,
            output,
            trades_csv,
        } => {
            let inputs = RunInputs::from(data);
            backtest::run(
                &inputs,
                backtest::BacktestOutputs {
                    report: output.as_deref(),
                    trades_csv: trades_csv.as_deref(),
                },
            )?;
        }
        Commands::Optimize {
            data,
            grid,
            objective,
            max_drawdown,
            top,
            output,
        } => {
            let inputs = RunInputs::from(data);
            optimize::run(
                &inputs,
                optimize::OptimizeArgs {
                    grid: &grid,
                    objective: Objective::parse(&objective)?,
                    max_drawdown,
                    top,
                    output: output.as_deref(),
                },
            )?;
        }
        Commands::ExportSnapshot {
            inputs,
            output,
            symbol,
            timeframe,
        } => {
            export_snapshot::run(&inputs, symbol.as_deref(), &timeframe, &output)?;
        }
        Commands::ClearCache { cache_dir } => {
            clear_cache::run(&cache_dir)?;
        }
    }

    Ok(())
}
