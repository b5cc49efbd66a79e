use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ctxvault::cli::{self, input::read_stdin, HookOutput};
use ctxvault::config::VaultConfig;
use ctxvault::context::EngineContext;

/// Grace period for a stdin reader still blocked after a timeout.
const RUNTIME_SHUTDOWN: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "ctxvault", version, about = "Lossless context archival for assistant compaction hooks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// PreCompact hook: archive all turns, print compaction guidance
    ArchiveBeforeCompaction,
    /// SessionStart hook: restore archived context after compact or clear
    RestoreAfterStart,
    /// UserPromptSubmit hook: archive proactively and report context usage
    ArchiveOnPrompt,
    /// Show archive and autopilot status
    Status,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to the configured cache directory
    Download,
}

impl Command {
    fn is_hook(&self) -> bool {
        matches!(
            self,
            Command::ArchiveBeforeCompaction | Command::RestoreAfterStart | Command::ArchiveOnPrompt
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, config_error) = match VaultConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (VaultConfig::default(), Some(e)),
    };

    // Log to stderr so stdout carries only the hook payload.
    let filter = EnvFilter::try_new(&config.hooks.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    if let Some(e) = config_error {
        tracing::warn!("[ctxvault] using default config: {e:#}");
    }

    let is_hook = cli.command.is_hook();
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::warn!("[ctxvault] failed to start runtime: {e}");
            return if is_hook { ExitCode::SUCCESS } else { ExitCode::FAILURE };
        }
    };

    let result = runtime.block_on(run(cli.command, config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);

    if cli::report_outcome(result, is_hook) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(command: Command, config: VaultConfig) -> Result<()> {
    match command {
        Command::Status => {
            let ctx = EngineContext::resolve_existing(config).await;
            let report = cli::status::status_report(&ctx).await;
            ctx.shutdown().await;
            print!("{}", report?);
        }
        Command::Model { action } => match action {
            ModelAction::Download => cli::model::model_download(&config.embedding).await?,
        },
        hook => {
            let timeout = Duration::from_millis(config.hooks.stdin_timeout_ms);
            let Some(input) = read_stdin(timeout).await else {
                return Ok(());
            };
            let ctx = EngineContext::resolve(config).await;
            let output: Result<HookOutput> = match hook {
                Command::ArchiveBeforeCompaction => cli::archive::archive_before_compaction(&ctx, &input).await,
                Command::RestoreAfterStart => cli::restore::restore_after_start(&ctx, &input).await,
                Command::ArchiveOnPrompt => cli::prompt::archive_on_prompt(&ctx, &input).await,
                Command::Status | Command::Model { .. } => Ok(HookOutput::silent()),
            };
            ctx.shutdown().await;
            output?.emit();
        }
    }
    Ok(())
}
