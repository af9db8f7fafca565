use std::path::PathBuf;

pub(super) fn run_report(input: PathBuf) -> Result<(), String> {
    let reader = crate::infra::build_artifact_reader();
    let result = vantage_application::reporting::generate_report(input.as_path(), reader.as_ref())?;
    let pretty = serde_json::to_string_pretty(&result.to_json())
        .map_err(|err| format!("failed to render report: {err}"))?;
    println!("{pretty}");

    if !result.is_consistent() {
        let mut problems = result.mismatches.clone();
        if result.fingerprint_matches == Some(false) {
            problems.push("fingerprint".to_string());
        }
        return Err(format!(
            "run {} does not match its summary: {}",
            result.run_id,
            problems.join(", ")
        ));
    }
    println!(
        "vantage cli: report verified (run_id={}, trades={}, bars={})",
        result.run_id, result.summary.trades, result.summary.bars_processed
    );
    Ok(())
}
