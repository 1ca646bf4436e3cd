//! ssmd - Suwayomi Source Merger daemon
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use ssm_core::config::Settings;
use ssmd::Supervisor;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "ssmd", about = "Suwayomi Source Merger daemon")]
struct Cli {
    /// Directory containing settings.yml, manga_equivalents.yml,
    /// scene_tags.yml and source_priority.yml.
    #[arg(long, env = "SSM_CONFIG_DIR", default_value = "/ssm/config")]
    config_dir: PathBuf,

    /// Run a single scan pass and exit instead of starting the daemon.
    #[arg(long)]
    once: bool,
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let settings_path = cli.config_dir.join("settings.yml");
    let mut settings = match Settings::from_file(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!(path = %settings_path.display(), error = %e, "failed to load settings");
            return ExitCode::FAILURE;
        }
    };
    settings.config_dir = cli.config_dir;

    let supervisor = Supervisor::new(settings);

    let result = if cli.once {
        supervisor.run_once().await.map(|summary| {
            tracing::info!(
                groups = summary.groups,
                actions = summary.actions,
                failures = summary.failures,
                "scan pass complete"
            );
        })
    } else {
        supervisor.run().await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("ssmd exited with error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
