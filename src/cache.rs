use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::scrobble::ScrobblePayload;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Could not {action} the cache file {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cache file {} is not a list of scrobbles: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON array of scrobbles that could not be delivered yet.
#[derive(Debug, Clone)]
pub struct CacheFile {
    path: PathBuf,
}

impl CacheFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every cached scrobble and empties the file.
    pub fn load(&self) -> Result<Vec<ScrobblePayload>, CacheError> {
        let payloads = self.read()?;
        if payloads.is_empty() {
            return Ok(payloads);
        }
        fs::write(&self.path, "").map_err(|source| self.io_error("empty", source))?;
        debug!(
            "Loaded {} scrobbles from {} and emptied it",
            payloads.len(),
            self.path.display()
        );
        Ok(payloads)
    }

    /// Appends `payloads` after whatever is already cached and atomically rewrites the file.
    pub fn write(&self, payloads: &[ScrobblePayload]) -> Result<(), CacheError> {
        if payloads.is_empty() {
            debug!("Nothing to write to cache");
            return Ok(());
        }
        let mut merged = self.read()?;
        merged.extend_from_slice(payloads);

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir).map_err(|source| self.io_error("create", source))?;
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            serde_json::to_writer(&mut writer, &merged).map_err(|source| CacheError::Malformed {
                path: self.path.clone(),
                source,
            })?;
            writer
                .flush()
                .map_err(|source| self.io_error("write", source))?;
        }
        file.persist(&self.path)
            .map_err(|err| self.io_error("replace", err.error))?;
        info!(
            "Wrote {} scrobbles into cache ({} total)",
            payloads.len(),
            merged.len()
        );
        Ok(())
    }

    fn read(&self) -> Result<Vec<ScrobblePayload>, CacheError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache file {} does not exist", self.path.display());
                return Ok(Vec::new());
            }
            Err(source) => return Err(self.io_error("read", source)),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|source| CacheError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    fn io_error(&self, action: &'static str, source: std::io::Error) -> CacheError {
        CacheError::Io {
            action,
            path: self.path.clone(),
            source,
        }
    }
}
