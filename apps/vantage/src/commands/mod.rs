mod backtest;
mod common;
mod paper;
mod report;
mod sweep;
mod validate;

use std::path::PathBuf;

pub enum Command {
    Backtest { config: PathBuf, out: Option<PathBuf> },
    Paper { config: PathBuf, out: Option<PathBuf> },
    Sweep { sweep: PathBuf },
    Validate { config: PathBuf, strict: bool },
    Report { input: PathBuf },
}

pub fn run(command: Command) -> Result<(), String> {
    match command {
        Command::Backtest { config, out } => backtest::run_backtest(config, out),
        Command::Paper { config, out } => paper::run_paper(config, out),
        Command::Sweep { sweep } => sweep::run_sweep(sweep),
        Command::Validate { config, strict } => validate::run_validate(config, strict),
        Command::Report { input } => report::run_report(input),
    }
}
