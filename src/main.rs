use std::{
    io::{self, BufRead},
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use project_launcher::cache::{CacheKey, ResultCache};
use project_launcher::checks;
use project_launcher::client::ApiClient;
use project_launcher::config::{AppConfig, DEFAULT_RETENTION_DAYS};
use project_launcher::env_state::EnvState;
use project_launcher::instance::{InstanceCoordinator, InstanceRole};
use project_launcher::logging;
use project_launcher::model::MainModel;
use project_launcher::paths::AppDirs;
use project_launcher::runner::{TaskRunner, UiSender};
use project_launcher::scheduler::Scheduler;
use project_launcher::settings::SettingsStore;
use project_launcher::shell::{CheckDispatcher, Shell};
use serde_json::Value;
use tracing::{info, warn};

const UI_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about = "Project and task launcher", long_about = None)]
struct Cli {
    /// Service base URL (overrides LAUNCHER_API_URL)
    #[arg(long, global = true, value_name = "URL")]
    api_url: Option<String>,
    /// Result cache directory (overrides LAUNCHER_TEMP)
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,
    /// Log at debug level unless LAUNCHER_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the launcher (default command)
    Run {
        /// Start pinned offline, answering reads from the cache
        #[arg(long)]
        offline: bool,
        /// Background worker threads
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Remove cache entries older than the retention window
    PurgeCache {
        #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
        days: u64,
    },
    /// Print the cache key for a call
    CacheKey {
        #[arg(value_name = "FUNCTION")]
        function: String,
        /// Call arguments as JSON, e.g. "[4]"
        #[arg(value_name = "ARGS", default_value = "null")]
        args: String,
    },
    /// Print the settings file location and contents
    Settings,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let dirs = AppDirs::new()?;
    let mut config = AppConfig::from_env(&dirs);
    if let Some(url) = cli.api_url {
        config.api_url = Some(url);
    }
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }

    match cli.command.unwrap_or(Command::Run {
        offline: false,
        workers: 4,
    }) {
        Command::Run { offline, workers } => {
            config.worker_threads = workers;
            config.sanitize();
            run_launcher(config, &dirs, offline)
        }
        Command::PurgeCache { days } => {
            config.sanitize();
            purge_cache(&config, days)
        }
        Command::CacheKey { function, args } => {
            config.sanitize();
            print_cache_key(&config, &function, &args)
        }
        Command::Settings => print_settings(&dirs),
    }
}

fn run_launcher(config: AppConfig, dirs: &AppDirs, offline: bool) -> Result<()> {
    let env = EnvState::from_process();
    if offline {
        env.set(config.mode_keys.offline.as_str(), "1");
    }

    let coordinator = InstanceCoordinator::new(
        config.channel_name.as_str(),
        dirs.runtime_dir.as_path(),
        config.handshake_timeout,
    );
    let primary = match coordinator.start(&env.snapshot()) {
        Ok(InstanceRole::Secondary { forwarded }) => {
            info!(forwarded, "launcher already running; handed off to it");
            return Ok(());
        }
        Ok(InstanceRole::Primary(primary)) => Some(primary),
        Err(err) => {
            warn!(error = %err, "single-instance check failed; continuing without it");
            None
        }
    };

    let config = Arc::new(config);
    let client = config.api_url.as_deref().and_then(|url| match ApiClient::new(url) {
        Ok(client) => Some(client),
        Err(err) => {
            warn!(error = %err, "service client disabled");
            None
        }
    });
    if client.is_none() {
        warn!("no service URL configured; running from cache only");
    }
    let cache = match ResultCache::open(&config.cache_dir) {
        Ok(cache) => Some(cache),
        Err(err) => {
            warn!(error = %err, "result cache disabled");
            None
        }
    };
    let model = Arc::new(MainModel::new(client, cache));

    let (runner, queue) = TaskRunner::<Shell>::new(config.worker_threads);
    let mut shell = Shell::new(
        Arc::clone(&model),
        env,
        Arc::clone(&config),
        SettingsStore::new(dirs.settings_file()),
        runner.clone(),
    );

    let mut listener = primary.and_then(|primary| {
        let ui = runner.ui();
        let served = primary.serve(move |handoff| {
            ui.post(move |shell: &mut Shell| shell.receive_handoff(handoff));
        });
        match served {
            Ok(listener) => Some(listener),
            Err(err) => {
                warn!(error = %err, "not accepting handoffs");
                None
            }
        }
    });

    let dispatcher = CheckDispatcher::new(runner.clone(), Arc::clone(&model), &config);
    let scheduler = Scheduler::start(config.intervals, Arc::new(dispatcher));
    spawn_console_reader(runner.ui());
    println!("Type `help` for commands.");

    while !shell.should_quit() {
        queue.wait_and_pump(&mut shell, UI_POLL);
        for message in shell.take_messages() {
            println!("{message}");
        }
    }

    scheduler.stop();
    if let Some(listener) = listener.as_mut() {
        listener.shutdown();
    }
    runner.shutdown();
    info!("launcher stopped");
    Ok(())
}

fn spawn_console_reader(ui: UiSender<Shell>) {
    let spawned = thread::Builder::new()
        .name("launcher-console".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if !ui.post(move |shell: &mut Shell| shell.handle_command(&line)) {
                    return;
                }
            }
            ui.post(|shell: &mut Shell| shell.handle_command("quit"));
        });
    if let Err(err) = spawned {
        warn!(error = %err, "console input unavailable");
    }
}

fn purge_cache(config: &AppConfig, days: u64) -> Result<()> {
    let cache = ResultCache::open(&config.cache_dir)?;
    let report = checks::clean_cache(&cache, retention_days(days))?;
    println!(
        "Removed {} cache entries, kept {} ({})",
        report.removed,
        report.kept,
        cache.dir().display()
    );
    Ok(())
}

fn retention_days(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(86_400))
}

fn print_cache_key(config: &AppConfig, function: &str, args: &str) -> Result<()> {
    let key = match serde_json::from_str::<Value>(args) {
        Ok(value) => CacheKey::for_call(function, &value),
        Err(_) => CacheKey::for_call(function, args),
    };
    let cache = ResultCache::open(&config.cache_dir)?;
    println!("{}", key.as_str());
    println!("{}", cache.entry_path(&key).display());
    Ok(())
}

fn print_settings(dirs: &AppDirs) -> Result<()> {
    let store = SettingsStore::new(dirs.settings_file());
    let settings = store.load()?;
    println!("{}", store.path().display());
    println!(
        "{}",
        serde_json::to_string_pretty(&settings).context("Failed to render settings")?
    );
    Ok(())
}
