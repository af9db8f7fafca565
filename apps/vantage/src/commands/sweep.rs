use std::path::PathBuf;
use vantage_application::experiments::sweep::{run_sweep_with_hooks, RunStatus, SweepProgress};

pub(super) fn run_sweep(sweep_path: PathBuf) -> Result<(), String> {
    let deps = crate::infra::build_engine_deps();
    let catalog: &(dyn vantage_domain::repositories::catalog::CatalogRepository + Sync) =
        deps.catalog.as_ref();
    let artifacts: &(dyn vantage_domain::repositories::artifacts::ArtifactWriter + Sync) =
        deps.artifacts.as_ref();

    let mut on_progress = |progress: SweepProgress| {
        tracing::info!(
            completed = progress.completed_runs,
            total = progress.total_runs,
            ok = progress.ok_runs,
            skipped = progress.skipped_runs,
            errors = progress.error_runs,
            last_run_id = progress.last_run_id.as_deref().unwrap_or(""),
            "sweep progress"
        );
    };
    let result = run_sweep_with_hooks(
        &sweep_path,
        deps.market_data.as_ref(),
        catalog,
        artifacts,
        Some(&mut on_progress),
        None,
    )?;

    let count = |status: RunStatus| result.runs.iter().filter(|run| run.status == status).count();
    println!(
        "vantage cli: sweep {} finished (runs={}, ok={}, skipped={}, errors={})",
        result.sweep_id,
        result.runs.len(),
        count(RunStatus::Ok),
        count(RunStatus::Skipped),
        count(RunStatus::Error)
    );
    for run in result.runs.iter().filter(|run| run.status == RunStatus::Error) {
        println!(
            "  {}: {}",
            run.run_id,
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("sweep output: {}", result.sweep_dir.display());
    Ok(())
}
