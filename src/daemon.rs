use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::cache::CacheFile;
use crate::player::Disconnector;
use crate::queue::{Queue, flush_to_cache};

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Could not {action} pidfile {}: {source}", path.display())]
    Pidfile {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Already running with pid {0}")]
    AlreadyRunning(i32),
    #[error("Not running (no pid in {})", .0.display())]
    NotRunning(PathBuf),
    #[error("Could not detach from the terminal: {0}")]
    Detach(#[source] io::Error),
    #[error("Could not signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },
    #[error("Could not install the signal handler: {0}")]
    Handler(#[from] ctrlc::Error),
}

#[derive(Debug, Clone)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded pid; a missing or unparsable file reads as `None`.
    pub fn read(&self) -> Result<Option<i32>, DaemonError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(DaemonError::Pidfile {
                    action: "read",
                    path: self.path.clone(),
                    source,
                });
            }
        };
        match raw.trim().parse() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                warn!("Ignoring garbage in pidfile {}", self.path.display());
                Ok(None)
            }
        }
    }

    pub fn write_current(&self) -> Result<(), DaemonError> {
        let pid = process::id();
        fs::write(&self.path, format!("{pid}\n")).map_err(|source| DaemonError::Pidfile {
            action: "write",
            path: self.path.clone(),
            source,
        })?;
        info!("Running with pid {pid}");
        Ok(())
    }

    pub fn remove(&self) -> Result<(), DaemonError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DaemonError::Pidfile {
                action: "remove",
                path: self.path.clone(),
                source,
            }),
        }
    }
}

pub fn is_running(pid: i32) -> bool {
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Fails if the pidfile names a live process; a stale pidfile is removed.
pub fn ensure_not_running(pidfile: &Pidfile) -> Result<(), DaemonError> {
    let Some(pid) = pidfile.read()? else {
        return Ok(());
    };
    if is_running(pid) {
        return Err(DaemonError::AlreadyRunning(pid));
    }
    warn!("Removing stale pidfile {} (pid {pid})", pidfile.path().display());
    pidfile.remove()
}

/// Classic double fork. Only the grandchild returns; both parents exit 0.
pub fn daemonize() -> Result<(), DaemonError> {
    fork_and_exit_parent()?;
    if unsafe { libc::setsid() } < 0 {
        return Err(DaemonError::Detach(io::Error::last_os_error()));
    }
    fork_and_exit_parent()?;
    unsafe {
        libc::umask(0);
    }
    std::env::set_current_dir("/").map_err(DaemonError::Detach)?;
    redirect_stdio()
}

fn fork_and_exit_parent() -> Result<(), DaemonError> {
    match unsafe { libc::fork() } {
        -1 => Err(DaemonError::Detach(io::Error::last_os_error())),
        0 => Ok(()),
        _ => process::exit(0),
    }
}

fn redirect_stdio() -> Result<(), DaemonError> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(DaemonError::Detach)?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } < 0 {
            return Err(DaemonError::Detach(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Sends SIGTERM every 100ms until the process is gone, then removes the pidfile.
pub fn stop(pidfile: &Pidfile) -> Result<i32, DaemonError> {
    let pid = pidfile
        .read()?
        .ok_or_else(|| DaemonError::NotRunning(pidfile.path().to_path_buf()))?;
    info!("Stopping pid {pid}");
    loop {
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                break;
            }
            return Err(DaemonError::Signal { pid, source: err });
        }
        thread::sleep(STOP_POLL);
    }
    pidfile.remove()?;
    Ok(pid)
}

/// Everything the signal handler needs to leave no scrobble behind.
#[derive(Debug, Clone)]
pub struct Shutdown {
    pub watching: Arc<AtomicBool>,
    pub queue: Queue,
    pub cache: Option<CacheFile>,
    pub disconnector: Disconnector,
    pub pidfile: Option<Pidfile>,
}

impl Shutdown {
    /// The queue is flushed before the player is disconnected.
    pub fn terminate(&self) {
        self.watching.store(false, Ordering::SeqCst);
        match flush_to_cache(&self.queue, self.cache.as_ref()) {
            Ok(0) => debug!("Nothing queued at shutdown"),
            Ok(count) => info!("Cached {count} queued scrobbles"),
            Err(err) => error!("Could not cache queued scrobbles: {err}"),
        }
        self.disconnector.disconnect();
        if let Some(pidfile) = &self.pidfile {
            if let Err(err) = pidfile.remove() {
                error!("{err}");
            }
        }
    }
}

/// Runs `shutdown` and exits 0 on SIGINT or SIGTERM.
pub fn install_signal_handler(shutdown: Shutdown) -> Result<(), DaemonError> {
    ctrlc::set_handler(move || {
        info!("Caught termination signal, shutting down");
        shutdown.terminate();
        process::exit(0);
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    use tempfile::TempDir;

    use super::*;
    use crate::scrobble::{ScrobblePayload, Track};

    fn queued_track(timestamp: i64) -> Queue {
        let queue = Queue::default();
        let track = Track {
            artist: "Artist".to_string(),
            title: "Title".to_string(),
            album: None,
            album_artist: None,
            duration: Some(200),
        };
        queue.lock().push(ScrobblePayload::new(track, timestamp));
        queue
    }

    #[test]
    fn pidfile_round_trip() {
        let dir = TempDir::new().unwrap();
        let pidfile = Pidfile::new(dir.path().join("perch.pid"));
        assert_eq!(pidfile.read().unwrap(), None);

        pidfile.write_current().unwrap();
        assert_eq!(pidfile.read().unwrap(), Some(process::id() as i32));
        assert!(is_running(process::id() as i32));

        pidfile.remove().unwrap();
        assert!(!pidfile.path().exists());
        pidfile.remove().unwrap();
    }

    #[test]
    fn garbage_pidfile_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let pidfile = Pidfile::new(dir.path().join("perch.pid"));
        fs::write(pidfile.path(), "not a pid").unwrap();
        assert_eq!(pidfile.read().unwrap(), None);
        ensure_not_running(&pidfile).unwrap();
    }

    #[test]
    fn live_pid_refuses_second_start() {
        let dir = TempDir::new().unwrap();
        let pidfile = Pidfile::new(dir.path().join("perch.pid"));
        pidfile.write_current().unwrap();
        let err = ensure_not_running(&pidfile).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)));
    }

    #[test]
    fn stop_without_pidfile_is_an_error() {
        let dir = TempDir::new().unwrap();
        let pidfile = Pidfile::new(dir.path().join("absent.pid"));
        assert!(matches!(stop(&pidfile), Err(DaemonError::NotRunning(_))));
    }

    #[test]
    fn terminate_flushes_queue_and_removes_pidfile() {
        let dir = TempDir::new().unwrap();
        let cache = CacheFile::new(dir.path().join("cache.json"));
        let pidfile = Pidfile::new(dir.path().join("perch.pid"));
        pidfile.write_current().unwrap();

        let queue = queued_track(1_700_000_000);

        let shutdown = Shutdown {
            watching: Arc::new(AtomicBool::new(true)),
            queue: queue.clone(),
            cache: Some(cache.clone()),
            disconnector: Disconnector::default(),
            pidfile: Some(pidfile.clone()),
        };
        shutdown.terminate();

        assert!(!shutdown.watching.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 0);
        let cached = cache.load().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].timestamp, 1_700_000_000);
        assert!(!pidfile.path().exists());
    }

    #[test]
    fn cache_is_written_before_player_socket_closes() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("cache.json");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        // The player side sees EOF once the socket is shut down.
        let observed = cache_path.clone();
        let player = thread::spawn(move || {
            let mut buf = [0u8; 16];
            while server.read(&mut buf).unwrap_or(0) > 0 {}
            fs::read_to_string(&observed).unwrap_or_default()
        });

        let disconnector = Disconnector::default();
        disconnector.replace(Some(client));
        let shutdown = Shutdown {
            watching: Arc::new(AtomicBool::new(true)),
            queue: queued_track(42),
            cache: Some(CacheFile::new(&cache_path)),
            disconnector,
            pidfile: None,
        };
        shutdown.terminate();

        let cached: Vec<ScrobblePayload> = serde_json::from_str(&player.join().unwrap()).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].timestamp, 42);
    }
}
