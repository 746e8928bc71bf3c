pub mod toml_config;

#[cfg(feature = "cli")]
use clap::Parser;

pub use toml_config::SyncConfig;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "veritas-sync")]
#[command(about = "Reconcile SIS rosters into directory and workspace accounts")]
pub struct CliConfig {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "veritas-sync.toml")]
    pub config: String,

    /// Plan changes and write the report without touching any store
    #[arg(long)]
    pub dry_run: bool,

    /// Keep running, syncing every N seconds
    #[arg(long)]
    pub interval: Option<u64>,

    /// Only sync the named store (repeatable)
    #[arg(long = "store")]
    pub stores: Vec<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

#[cfg(all(test, feature = "cli"))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_flags() {
        let cli = CliConfig::parse_from([
            "veritas-sync",
            "--config",
            "district.toml",
            "--dry-run",
            "--store",
            "ad",
            "--store",
            "google",
            "--interval",
            "900",
        ]);

        assert_eq!(cli.config, "district.toml");
        assert!(cli.dry_run);
        assert_eq!(cli.stores, vec!["ad", "google"]);
        assert_eq!(cli.interval, Some(900));
        assert!(!cli.verbose);
    }
}
