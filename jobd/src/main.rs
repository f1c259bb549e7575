use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jobctl_common::ControlConfig;
use jobctl_profiles::{JsonProfileStore, ProfileId, RunProfile, RunProfileManager};
use jobd::{ChannelSink, JobControl, JobEvent, ShellLauncher};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE: &str = "jobd.toml";
const DEFAULT_PROFILES_FILE: &str = "run_profiles.json";

#[derive(Parser, Debug)]
#[command(name = "jobd", version)]
#[command(about = "Launch worker jobs from run profiles and bind their connections")]
struct Cli {
    /// Path to the control configuration (jobd.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// First port to try for the control listener
    #[arg(long, global = true)]
    start_port: Option<u16>,

    /// End of the port range (exclusive)
    #[arg(long, global = true)]
    end_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dispatch a job and relay worker output until every worker is done
    Run(RunArgs),
    /// Manage the run profile store
    #[command(subcommand)]
    Profiles(ProfilesCommand),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Profile store
    #[arg(long, default_value = DEFAULT_PROFILES_FILE)]
    profiles: PathBuf,

    /// Profile to dispatch, by name (first match)
    #[arg(long, conflicts_with = "profile_id", required_unless_present = "profile_id")]
    profile: Option<String>,

    /// Profile to dispatch, by id
    #[arg(long)]
    profile_id: Option<u64>,

    /// Worker executable, resolved against `executable_dir` when bare
    #[arg(long)]
    executable: String,
}

#[derive(Subcommand, Debug)]
enum ProfilesCommand {
    /// List stored profiles
    List {
        #[arg(long, default_value = DEFAULT_PROFILES_FILE)]
        profiles: PathBuf,
    },
    /// Append the default single-replica local profile
    AddLocal {
        #[arg(long, default_value = DEFAULT_PROFILES_FILE)]
        profiles: PathBuf,
    },
    /// Write profiles to an export document
    Export {
        #[arg(long, default_value = DEFAULT_PROFILES_FILE)]
        profiles: PathBuf,
        /// Destination file
        #[arg(long)]
        out: PathBuf,
        /// Profile ids to export (all when omitted)
        #[arg(long = "id")]
        ids: Vec<u64>,
    },
    /// Add every profile of an export document under new ids
    Import {
        #[arg(long, default_value = DEFAULT_PROFILES_FILE)]
        profiles: PathBuf,
        /// Export document to read
        #[arg(long)]
        from: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    info!(
        "{}",
        jobctl_build_info::formatted_banner("jobd", env!("CARGO_PKG_VERSION"))
    );

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("JOBD_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
            candidate.is_file().then_some(candidate)
        });
    let mut config = ControlConfig::load(config_path.as_deref());
    if let Some(port) = cli.start_port {
        config.start_port = port;
    }
    if let Some(port) = cli.end_port {
        config.end_port = port;
    }

    match cli.command {
        Command::Run(args) => run_job(config, args).await,
        Command::Profiles(command) => manage_profiles(command),
    }
}

async fn run_job(config: ControlConfig, args: RunArgs) -> Result<()> {
    let store = JsonProfileStore::new(&args.profiles);
    let manager = RunProfileManager::load_from(&store)
        .with_context(|| format!("failed to load profiles from {}", args.profiles.display()))?;
    let mut profile = select_profile(&manager, &args)?.clone();
    let executable = config.resolve_executable(&args.executable);
    profile
        .substitute_executable_name(&executable)
        .with_context(|| format!("cannot launch '{}'", executable))?;

    if config.journal_secret == jobctl_common::config::DEFAULT_SECRET && config.journal_path.is_some() {
        warn!("Using default journal secret - set JOBD_SECRET in production!");
    }

    let control = JobControl::start(config, Arc::new(ShellLauncher::new())).await?;
    let (sink, mut events) = ChannelSink::new();
    let report = control
        .dispatch(&profile, &executable, Arc::new(sink))
        .await;

    if report.total() == 0 {
        bail!("profile '{}' has no commands", profile.name());
    }
    if report.launched() == 0 {
        bail!("none of the {} workers could be launched", report.total());
    }
    info!(
        job_id = %report.job_id,
        launched = report.launched(),
        failed = report.failed(),
        port = control.port(),
        "Waiting for workers"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(JobEvent::Connected(session)) => {
                    info!(job_number = %session.job_number(), peer = %session.peer(), "Worker connected");
                }
                Some(JobEvent::Data { data, .. }) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(JobEvent::Lost { job_number, reason }) => {
                    info!(%job_number, "Worker finished: {}", reason);
                }
                Some(JobEvent::LaunchFailed { job_number, error }) => {
                    warn!(%job_number, "Worker failed before connecting: {}", error);
                }
                None => break,
            },
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                control.abort_job(report.job_id);
                break;
            }
        }
        if control.job_finished(report.job_id) {
            break;
        }
    }

    let stats = control.stats();
    info!(
        bound = stats.bound,
        rejected = stats.rejected,
        handshake_lost = stats.handshake_lost,
        launch_failures = stats.launch_failures,
        "Job complete"
    );
    control.shutdown();
    Ok(())
}

fn select_profile<'a>(manager: &'a RunProfileManager, args: &RunArgs) -> Result<&'a RunProfile> {
    match (&args.profile, args.profile_id) {
        (_, Some(id)) => manager
            .profile_by_id(ProfileId(id))
            .ok_or_else(|| anyhow!("no run profile with id {}", id)),
        (Some(name), None) => manager
            .find_by_name(name)
            .ok_or_else(|| anyhow!("no run profile named '{}'", name)),
        (None, None) => bail!("either --profile or --profile-id is required"),
    }
}

fn manage_profiles(command: ProfilesCommand) -> Result<()> {
    match command {
        ProfilesCommand::List { profiles } => {
            let manager = load_manager(&profiles)?;
            if manager.is_empty() {
                println!("No run profiles in {}", profiles.display());
            }
            for profile in manager.iter() {
                println!(
                    "{:>4}  {:<24} {:>4} jobs  {}",
                    profile.id(),
                    profile.name(),
                    profile.total_jobs(),
                    if profile.delegates_to_manager() {
                        profile.manager_command_template()
                    } else {
                        "(direct)"
                    }
                );
            }
        }
        ProfilesCommand::AddLocal { profiles } => {
            let store = JsonProfileStore::new(&profiles);
            let mut manager = RunProfileManager::load_from(&store)?;
            let id = manager.add_default_local_profile();
            store.save_all(&manager)?;
            println!("Added profile {}", id);
        }
        ProfilesCommand::Export { profiles, out, ids } => {
            let manager = load_manager(&profiles)?;
            let ids: Vec<ProfileId> = if ids.is_empty() {
                manager.iter().map(RunProfile::id).collect()
            } else {
                ids.into_iter().map(ProfileId).collect()
            };
            manager.write_profiles_to_disk(&out, &ids)?;
            println!("Exported {} profiles to {}", ids.len(), out.display());
        }
        ProfilesCommand::Import { profiles, from } => {
            let store = JsonProfileStore::new(&profiles);
            let mut manager = RunProfileManager::load_from(&store)?;
            let ids = manager
                .import_profiles_from_disk(&from)
                .with_context(|| format!("failed to import {}", from.display()))?;
            store.save_all(&manager)?;
            println!("Imported {} profiles", ids.len());
        }
    }
    Ok(())
}

fn load_manager(path: &Path) -> Result<RunProfileManager> {
    RunProfileManager::load_from(&JsonProfileStore::new(path))
        .with_context(|| format!("failed to load profiles from {}", path.display()))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                if signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C; aborting job");
                }
                return;
            }
        };
        tokio::select! {
            result = signal::ctrl_c() => {
                if result.is_ok() {
                    info!("Received Ctrl+C; aborting job");
                }
            }
            _ = sigterm.recv() => info!("Received SIGTERM; aborting job"),
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; aborting job");
        }
    }
}
