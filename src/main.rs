use clap::Parser;
use std::time::Duration;
use veritas_sync::adapters::build_targets;
use veritas_sync::utils::error::{ErrorSeverity, SyncError};
use veritas_sync::utils::{logger, validation::Validate};
use veritas_sync::{
    CliConfig, CsvRosterSource, EngineOptions, LocalStorage, Mapper, SyncConfig, SyncEngine,
};

fn exit_code(e: &SyncError) -> i32 {
    match e.severity() {
        ErrorSeverity::Low => 0,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::High => 1,
        ErrorSeverity::Critical => 3,
    }
}

fn fail(e: SyncError) -> ! {
    tracing::error!(
        "❌ Sync failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 Suggestion: {}", e.recovery_suggestion());
    std::process::exit(exit_code(&e).max(1));
}

#[tokio::main]
async fn main() {
    let cli = CliConfig::parse();
    logger::init_cli_logger(cli.verbose, cli.json_logs);

    tracing::info!("Starting veritas-sync");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    let mut config = match SyncConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => fail(e),
    };
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        fail(e);
    }
    if cli.dry_run {
        config.sync.dry_run = Some(true);
    }

    let targets = match build_targets(&config, &cli.stores) {
        Ok(targets) => targets,
        Err(e) => fail(e),
    };
    tracing::info!(
        "Loaded '{}' with {} store(s){}",
        config.sync.name,
        targets.len(),
        if config.dry_run() { ", dry run" } else { "" }
    );

    let roster = CsvRosterSource::new(
        LocalStorage::new(config.sis.base_path.clone()),
        config.sis.students.clone(),
        config.sis.staff.clone(),
    );
    let engine = SyncEngine::new(
        roster,
        Mapper::from_config(&config),
        targets,
        EngineOptions::from_config(&config),
        LocalStorage::new(config.report_path()),
    );

    if let Some(seconds) = cli.interval {
        if let Err(e) = engine.run_scheduled(Duration::from_secs(seconds.max(1))).await {
            fail(e);
        }
        return;
    }

    match engine.run_once().await {
        Ok(report) => {
            for store in &report.stores {
                println!(
                    "{}: {:?} ({} applied, {} failed, {} conflicts)",
                    store.store,
                    store.outcome,
                    store.applied.values().sum::<usize>(),
                    store.failures.len(),
                    store.conflicts.len()
                );
            }
            if report.has_failures() {
                tracing::warn!("⚠️ Sync finished with failures");
                std::process::exit(1);
            }
            tracing::info!("✅ Sync completed successfully");
        }
        Err(e) => fail(e),
    }
}
