use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info};

mod cache;
mod config;
mod daemon;
mod eligibility;
mod logging;
mod player;
mod queue;
mod scrobble;
mod service;
#[cfg(test)]
mod testing;
mod watcher;

use crate::cache::CacheFile;
use crate::config::{Config, absolute_path, find_config, hash_password, load_config};
use crate::daemon::{DaemonError, Pidfile, Shutdown};
use crate::eligibility::EligibilityTimer;
use crate::logging::LogLevel;
use crate::player::{MpdLink, PlayerLink};
use crate::queue::{DeliveryOptions, DeliveryQueue};
use crate::service::{ScrobbleClient, ServiceKeys};
use crate::watcher::{POLL_PAUSE, Watcher};

#[derive(Parser)]
#[command(
    name = "perch",
    version,
    about = "Scrobble MPD playback to Last.fm or Libre.fm"
)]
struct Cli {
    #[command(flatten)]
    globals: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    #[arg(long, global = true, value_name = "PATH", help = "Configuration file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Pidfile location")]
    pidfile: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Append log output to this file")]
    logfile: Option<PathBuf>,
    #[arg(long = "log", global = true, value_enum, help = "Log level")]
    loglevel: Option<LogLevel>,
}

#[derive(Subcommand)]
enum Commands {
    /// Detach and scrobble in the background
    Start,
    /// Stop the background scrobbler
    Stop,
    /// Stop, then start again
    Restart,
    /// Scrobble in the foreground
    Run,
    /// Print the md5 hash of a password for the config file
    HashPassword,
}

/// Remote session obtained before detaching.
struct Session {
    keys: ServiceKeys,
    key: String,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::HashPassword => {
            let password = prompt_password_confirm()?;
            println!("{}", hash_password(&password));
        }
        Commands::Stop => {
            logging::init(cli.globals.loglevel.unwrap_or_default(), None)?;
            let pidfile = Pidfile::new(pidfile_path(&cli.globals)?);
            let pid = daemon::stop(&pidfile)?;
            println!("Stopped perch (pid {pid})");
        }
        Commands::Restart => {
            let config = configure(&cli.globals)?;
            let pidfile = Pidfile::new(config.pidfile());
            match daemon::stop(&pidfile) {
                Ok(pid) => info!("Stopped pid {pid}"),
                Err(DaemonError::NotRunning(_)) => info!("Not running, starting"),
                Err(err) => return Err(err.into()),
            }
            start(config, true)?;
        }
        Commands::Start => start(configure(&cli.globals)?, true)?,
        Commands::Run => start(configure(&cli.globals)?, false)?,
    }
    Ok(())
}

/// Loads the config file, applies command line overrides and installs the logger.
fn configure(globals: &GlobalArgs) -> Result<Config> {
    let path = find_config(globals.config.as_deref())?;
    let mut config = load_config(&path)?;
    if let Some(pidfile) = &globals.pidfile {
        config.scrobbler.pidfile = Some(absolute_path(pidfile)?);
    }
    if let Some(logfile) = &globals.logfile {
        config.scrobbler.logfile = Some(absolute_path(logfile)?);
    }
    if let Some(level) = globals.loglevel {
        config.scrobbler.loglevel = Some(level);
    }
    logging::init(config.loglevel(), config.scrobbler.logfile.as_deref())?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// `stop` works without a config file when `--pidfile` is given.
fn pidfile_path(globals: &GlobalArgs) -> Result<PathBuf> {
    if let Some(pidfile) = &globals.pidfile {
        return absolute_path(pidfile);
    }
    let path = find_config(globals.config.as_deref())?;
    Ok(load_config(&path)?.pidfile())
}

fn start(config: Config, detach: bool) -> Result<()> {
    let pidfile = detach.then(|| Pidfile::new(config.pidfile()));
    if let Some(pidfile) = &pidfile {
        daemon::ensure_not_running(pidfile)?;
    }

    // Fail on the terminal, not in the detached process.
    let session = authenticate(&config)?;
    probe_player(&config)?;

    if let Some(pidfile) = &pidfile {
        daemon::daemonize()?;
        pidfile.write_current()?;
    }
    scrobble(&config, session, pidfile)
}

fn authenticate(config: &Config) -> Result<Session> {
    let remote = &config.remote;
    let keys = ServiceKeys::for_remote(remote);
    let password = remote
        .password_md5()
        .context("No remote password configured")?;
    // Dropped before forking; the blocking client owns a runtime thread.
    let client = ScrobbleClient::login(remote.service, keys.clone(), &remote.username, &password)
        .with_context(|| format!("Could not log in to {}", remote.service.name()))?;
    Ok(Session {
        keys,
        key: client.session_key().to_string(),
    })
}

fn probe_player(config: &Config) -> Result<()> {
    let mut player = mpd_link(config);
    player.connect()?;
    player.disconnect();
    Ok(())
}

fn mpd_link(config: &Config) -> MpdLink {
    MpdLink::new(
        &config.mpd.host,
        config.mpd.port,
        config.mpd.password.as_deref(),
    )
}

fn scrobble(config: &Config, session: Session, pidfile: Option<Pidfile>) -> Result<()> {
    let reporter = ScrobbleClient::with_session(config.remote.service, session.keys, session.key)?;
    let mut player = mpd_link(config);
    player.connect()?;

    let options = DeliveryOptions {
        now_playing: config.scrobbler.now_playing,
        scrobble_after: config.scrobbler.scrobble_after,
    };
    let cache = config.scrobbler.cache.clone().map(CacheFile::new);
    if let Some(cache) = &cache {
        info!("Caching undelivered scrobbles in {}", cache.path().display());
    }
    let delivery = DeliveryQueue::new(reporter, cache, options);
    delivery.recover();
    debug!("{} scrobbles pending after recovery", delivery.queue().len());

    let disconnector = player.disconnector();
    let timer = EligibilityTimer::new(config.scrobbler.scrobble_point, POLL_PAUSE);
    let mut watcher = Watcher::new(player, delivery, timer);
    let shutdown = Shutdown {
        watching: watcher.watching(),
        queue: watcher.delivery().queue().clone(),
        cache: watcher.delivery().cache().cloned(),
        disconnector,
        pidfile,
    };
    daemon::install_signal_handler(shutdown.clone())?;

    let result = watcher.watch();
    watcher.stop();
    shutdown.terminate();
    watcher.player_mut().disconnect();
    if let Err(err) = result {
        error!("{err}");
        return Err(err.into());
    }
    Ok(())
}

fn prompt_password_confirm() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        bail!("Passwords do not match.");
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "perch",
            "run",
            "--config",
            "/etc/perch.json",
            "--log",
            "critical",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.globals.config, Some(PathBuf::from("/etc/perch.json")));
        assert_eq!(cli.globals.loglevel, Some(LogLevel::Critical));
    }

    #[test]
    fn rejects_unknown_log_level() {
        assert!(Cli::try_parse_from(["perch", "--log", "verbose", "start"]).is_err());
    }

    #[test]
    fn explicit_pidfile_skips_config_lookup() {
        let cli = Cli::try_parse_from([
            "perch",
            "stop",
            "--pidfile",
            "/run/perch.pid",
            "--config",
            "/nonexistent/perch.json",
        ])
        .unwrap();
        assert_eq!(
            pidfile_path(&cli.globals).unwrap(),
            PathBuf::from("/run/perch.pid")
        );
    }
}
