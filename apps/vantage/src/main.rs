mod commands;
mod infra;
mod obs;

use clap::{Parser, Subcommand};
use commands::Command;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vantage")]
#[command(about = "Vantage trading simulator", version, arg_required_else_help = true)]
#[command(
    after_help = "Examples:\n  vantage backtest --config configs/sample.toml --out runs/\n  vantage paper --config configs/paper.toml\n  vantage sweep --sweep configs/sweep.toml\n  vantage validate --config configs/sample.toml --strict\n  vantage report --input runs/<run_id>/\n"
)]
struct Cli {
    /// Default log filter; `VANTAGE_LOG` takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// `text` or `json`.
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
    /// Serve Prometheus metrics on host:port while the command runs.
    #[arg(long, global = true)]
    metrics_addr: Option<String>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Replay the configured OHLCV file through the simulator.
    Backtest {
        #[arg(long, env = "VANTAGE_CONFIG")]
        config: PathBuf,
        /// Overrides `data.out_dir`.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the simulator on paced replay bars or on closed candles polled from the exchange.
    /// Ctrl-C stops a polling run and still writes its artifacts.
    Paper {
        #[arg(long, env = "VANTAGE_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run a parameter grid described by a sweep file.
    Sweep {
        #[arg(long)]
        sweep: PathBuf,
    },
    /// Check the configured data against the `[data_quality]` limits.
    Validate {
        #[arg(long, env = "VANTAGE_CONFIG")]
        config: PathBuf,
        /// Fail when any limit is exceeded.
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Recompute a finished run's summary from its artifacts and compare it with summary.json.
    Report {
        #[arg(long)]
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = obs::init_tracing(&cli.log_level, &cli.log_format) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    if let Err(err) = obs::init_metrics(cli.metrics_addr.as_deref()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    let command = match cli.command {
        CliCommand::Backtest { config, out } => Command::Backtest { config, out },
        CliCommand::Paper { config, out } => Command::Paper { config, out },
        CliCommand::Sweep { sweep } => Command::Sweep { sweep },
        CliCommand::Validate { config, strict } => Command::Validate { config, strict },
        CliCommand::Report { input } => Command::Report { input },
    };

    if let Err(err) = commands::run(command) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
