use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::eligibility::DEFAULT_SCROBBLE_POINT;
use crate::logging::LogLevel;
use crate::service::Service;

const SYSTEM_CONFIG_PATH: &str = "/usr/local/etc/perch.json";
const DEFAULT_PIDFILE: &str = "/tmp/perch.pid";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpdConfig {
    #[serde(default = "default_mpd_host")]
    pub host: String,
    #[serde(default = "default_mpd_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: default_mpd_host(),
            port: default_mpd_port(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_service")]
    pub service: Service,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
}

impl RemoteConfig {
    /// The md5 hex digest of the password; `password_hash` wins when both are set.
    pub fn password_md5(&self) -> Option<String> {
        if let Some(hash) = &self.password_hash {
            return Some(hash.to_lowercase());
        }
        self.password.as_deref().map(hash_password)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrobblerConfig {
    #[serde(default = "default_now_playing")]
    pub now_playing: bool,
    #[serde(default)]
    pub scrobble_after: usize,
    #[serde(default = "default_scrobble_point")]
    pub scrobble_point: f64,
    #[serde(default)]
    pub cache: Option<PathBuf>,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    #[serde(default)]
    pub logfile: Option<PathBuf>,
    #[serde(default)]
    pub loglevel: Option<LogLevel>,
}

impl Default for ScrobblerConfig {
    fn default() -> Self {
        Self {
            now_playing: default_now_playing(),
            scrobble_after: 0,
            scrobble_point: default_scrobble_point(),
            cache: None,
            pidfile: None,
            logfile: None,
            loglevel: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mpd: MpdConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub scrobbler: ScrobblerConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.remote.username.trim().is_empty() {
            bail!("The remote username must be specified!");
        }
        if self.remote.password_md5().is_none() {
            bail!("The remote password or password_hash must be specified!");
        }
        if self.remote.service == Service::LastFm
            && (self.remote.api_key.is_none() || self.remote.api_secret.is_none())
        {
            bail!("Last.fm needs api_key and api_secret");
        }
        let point = self.scrobbler.scrobble_point;
        if !(0.5..=1.0).contains(&point) {
            bail!("scrobble_point must be between 0.5 and 1.0, got {point}");
        }
        Ok(())
    }

    /// Makes every configured path absolute so it survives the daemon's `chdir("/")`.
    pub fn resolve_paths(&mut self) -> Result<()> {
        for path in [
            &mut self.scrobbler.cache,
            &mut self.scrobbler.pidfile,
            &mut self.scrobbler.logfile,
        ]
        .into_iter()
        .flatten()
        {
            let resolved = absolute_path(path)?;
            *path = resolved;
        }
        Ok(())
    }

    pub fn pidfile(&self) -> PathBuf {
        self.scrobbler
            .pidfile
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PIDFILE))
    }

    pub fn loglevel(&self) -> LogLevel {
        self.scrobbler.loglevel.unwrap_or_default()
    }
}

fn default_mpd_host() -> String {
    "localhost".to_string()
}

fn default_mpd_port() -> u16 {
    6600
}

fn default_service() -> Service {
    Service::LastFm
}

fn default_now_playing() -> bool {
    true
}

fn default_scrobble_point() -> f64 {
    DEFAULT_SCROBBLE_POINT
}

pub fn default_config_path() -> PathBuf {
    let fallback = PathBuf::from(".config/perch/config.json");
    dirs::home_dir().map_or(fallback, |home| home.join(".config/perch/config.json"))
}

/// Candidate config files, most specific first.
pub fn config_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(default_config_path());
    candidates.push(PathBuf::from(SYSTEM_CONFIG_PATH));
    candidates
}

pub fn find_config(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let path = absolute_path(path)?;
        if !path.exists() {
            bail!("Configuration file {} does not exist", path.display());
        }
        return Ok(path);
    }
    config_candidates(None)
        .into_iter()
        .find(|path| path.exists())
        .context("No configuration file found!")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading config at {}", path.display()))?;
    let mut config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing config at {}", path.display()))?;
    config.validate()?;
    config.resolve_paths()?;
    Ok(config)
}

pub fn hash_password(password: &str) -> String {
    format!("{:x}", md5::compute(password))
}

/// Expands a leading `~` and anchors relative paths at the current directory.
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .context("Cannot expand ~ without a home directory")?
            .join(rest),
        Err(_) => path.to_path_buf(),
    };
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    let cwd = std::env::current_dir().context("Failed reading the current directory")?;
    Ok(cwd.join(expanded))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"remote": {"service": "librefm", "username": "bird", "password": "hunter2"}}"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.mpd.host, "localhost");
        assert_eq!(config.mpd.port, 6600);
        assert!(config.scrobbler.now_playing);
        assert_eq!(config.scrobbler.scrobble_after, 0);
        assert_eq!(config.scrobbler.scrobble_point, 0.5);
        assert_eq!(config.loglevel(), LogLevel::Warning);
        assert_eq!(config.pidfile(), PathBuf::from(DEFAULT_PIDFILE));
        assert_eq!(
            config.remote.password_md5().as_deref(),
            Some(hash_password("hunter2").as_str())
        );
    }

    #[test]
    fn password_hash_wins_over_password() {
        let remote = RemoteConfig {
            service: Service::LibreFm,
            username: "bird".to_string(),
            password: Some("plain".to_string()),
            password_hash: Some("ABCDEF".to_string()),
            api_key: None,
            api_secret: None,
        };
        assert_eq!(remote.password_md5().as_deref(), Some("abcdef"));
    }

    #[test]
    fn rejects_out_of_range_scrobble_point() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"remote": {"service": "librefm", "username": "bird", "password": "pw"},
                "scrobbler": {"scrobble_point": 0.3}}"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("scrobble_point"));
    }

    #[test]
    fn lastfm_requires_api_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"remote": {"username": "bird", "password_hash": "00"}}"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn missing_password_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"remote": {"service": "librefm", "username": "bird"}}"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn unknown_loglevel_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"remote": {"service": "librefm", "username": "bird", "password": "pw"},
                "scrobbler": {"loglevel": "verbose"}}"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn relative_paths_become_absolute() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"remote": {"service": "librefm", "username": "bird", "password": "pw"},
                "scrobbler": {"cache": "scrobbles.json", "loglevel": "debug"}}"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.loglevel(), LogLevel::Debug);
        let cache = config.scrobbler.cache.clone().unwrap();
        assert!(cache.is_absolute());
        assert!(cache.ends_with("scrobbles.json"));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(find_config(Some(&dir.path().join("absent.json"))).is_err());
        let candidates = config_candidates(Some(Path::new("/etc/custom.json")));
        assert_eq!(candidates[0], PathBuf::from("/etc/custom.json"));
        assert_eq!(candidates.last(), Some(&PathBuf::from(SYSTEM_CONFIG_PATH)));
    }
}
