mod commands;
mod error;
mod logging;
mod menu;
mod metrics;
mod output;
mod prompt;

use crate::commands::Operation;
use crate::prompt::PromptConfirm;
use clap::{Parser, Subcommand};
use sitekeeper_common::{AppConfig, SiteError};
use sitekeeper_host::{HostContext, Interrupt};
use std::process::ExitCode;
use tracing::{debug, warn};

/// Manage web server virtual hosts and their TLS certificates
#[derive(Parser, Debug)]
#[command(name = "sitekeeper", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Answer yes to every confirmation question
    #[arg(short, long, global = true)]
    yes: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Operation(Operation),
    /// Interactive menu (default when no subcommand is given)
    Menu,
}

impl Commands {
    fn mutates(&self) -> bool {
        match self {
            Commands::Operation(op) => op.mutates(),
            Commands::Menu => true,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    logging::init(&config.log_file);

    let interrupt = Interrupt::new();
    let _ctrl_c = interrupt.listen_for_ctrl_c();

    let command = cli.command.unwrap_or(Commands::Menu);
    let metrics_textfile = config.metrics_textfile.clone();
    let result = run(config, command, cli.yes, interrupt).await;

    if let Some(path) = metrics_textfile
        && let Err(err) = metrics::write_textfile(&path)
    {
        warn!(path = %path.display(), error = %err, "cannot write metrics textfile");
    }

    Ok(match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(error::report(&err)),
    })
}

async fn run(
    config: AppConfig,
    command: Commands,
    assume_yes: bool,
    interrupt: Interrupt,
) -> Result<(), SiteError> {
    ensure_privileges(&config, command.mutates())?;

    let ctx = HostContext::for_system(config, output::progress_printer(), interrupt).await?;
    if ctx.web_server_conflict {
        warn!("both apache2 and nginx are active; managing apache2");
    }
    let confirm = PromptConfirm::new(assume_yes);

    match command {
        Commands::Operation(op) => commands::execute(&ctx, op, &confirm).await,
        Commands::Menu => menu::run(&ctx, &confirm).await,
    }
}

fn ensure_privileges(config: &AppConfig, mutating: bool) -> Result<(), SiteError> {
    if !config.require_root || !mutating {
        return Ok(());
    }
    let euid = unsafe { libc::geteuid() };
    debug!(euid, "checking privileges");
    if euid != 0 {
        return Err(SiteError::Privilege(format!(
            "running as uid {}, root is required (set SITEKEEPER_REQUIRE_ROOT=false to skip)",
            euid
        )));
    }
    Ok(())
}
