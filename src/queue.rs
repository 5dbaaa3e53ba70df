use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use crate::cache::{CacheError, CacheFile};
use crate::scrobble::{ScrobblePayload, Song, Track};
use crate::service::RemoteReporter;

/// Pending scrobbles in playback order, shared with the shutdown path.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    inner: Arc<Mutex<Vec<ScrobblePayload>>>,
}

impl Queue {
    pub fn lock(&self) -> MutexGuard<'_, Vec<ScrobblePayload>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub now_playing: bool,
    pub scrobble_after: usize,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            now_playing: true,
            scrobble_after: 0,
        }
    }
}

pub struct DeliveryQueue<R> {
    reporter: R,
    queue: Queue,
    cache: Option<CacheFile>,
    options: DeliveryOptions,
}

impl<R: RemoteReporter> DeliveryQueue<R> {
    pub fn new(reporter: R, cache: Option<CacheFile>, options: DeliveryOptions) -> Self {
        Self {
            reporter,
            queue: Queue::default(),
            cache,
            options,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn cache(&self) -> Option<&CacheFile> {
        self.cache.as_ref()
    }

    /// Queues the song as played at `timestamp`; songs without artist or title are dropped.
    pub fn enqueue(&self, song: &Song, timestamp: i64) -> bool {
        let Some(track) = Track::from_song(song) else {
            warn!("Cannot queue track: missing tag \"artist\" or \"title\"");
            return false;
        };
        debug!("Queued {} - {} for submission", track.artist, track.title);
        self.queue.lock().push(ScrobblePayload::new(track, timestamp));
        self.queue_updated();
        true
    }

    /// Submits cached scrobbles left over from an earlier run.
    pub fn recover(&self) {
        debug!("Checking cache for undelivered scrobbles");
        self.queue_updated();
    }

    pub fn queue_updated(&self) {
        let mut queue = self.queue.lock();
        if let Some(cache) = &self.cache {
            match cache.load() {
                Ok(cached) if !cached.is_empty() => {
                    info!("Loaded {} scrobbles from cache", cached.len());
                    queue.splice(0..0, cached);
                }
                Ok(_) => {}
                Err(err) => error!("Could not load scrobbles from cache: {err}"),
            }
        }
        if queue.is_empty() {
            debug!("Queue empty, nothing to submit");
            return;
        }
        let after = self.options.scrobble_after;
        if after > 1 && queue.len() < after {
            debug!("Holding {} of {after} scrobbles before submitting", queue.len());
            return;
        }

        match self.reporter.report_batch(&queue) {
            Ok(()) => {
                info!("Submitted {} scrobbles", queue.len());
                queue.clear();
            }
            Err(err) => {
                let delivered = err.delivered().min(queue.len());
                if delivered > 0 {
                    info!("Submitted {delivered} scrobbles before the failure");
                    queue.drain(..delivered);
                }
                warn!("Could not submit {} scrobbles: {err}", queue.len());
                match write_to_cache(self.cache.as_ref(), &queue) {
                    Ok(true) => queue.clear(),
                    Ok(false) => {
                        warn!("No cache configured, dropping {} scrobbles", queue.len());
                        queue.clear();
                    }
                    Err(err) => error!(
                        "Could not cache scrobbles, keeping {} in memory: {err}",
                        queue.len()
                    ),
                }
            }
        }
    }

    /// Best effort; failures are logged and never retried.
    pub fn now_playing_updated(&self, song: Option<&Song>) {
        if !self.options.now_playing {
            return;
        }
        let Some(song) = song else {
            debug!("Nothing is playing");
            return;
        };
        let Some(track) = Track::from_song(song) else {
            warn!("Cannot update now playing: missing tag \"artist\" or \"title\"");
            return;
        };
        if let Err(err) = self.reporter.report_now_playing(&track) {
            error!("Could not update now playing: {err}");
        }
    }
}

/// Moves everything queued into the cache. Returns how many scrobbles were written.
pub fn flush_to_cache(queue: &Queue, cache: Option<&CacheFile>) -> Result<usize, CacheError> {
    let mut queue = queue.lock();
    if queue.is_empty() {
        return Ok(0);
    }
    let count = queue.len();
    if write_to_cache(cache, &queue)? {
        queue.clear();
        return Ok(count);
    }
    warn!("No cache configured, {count} queued scrobbles are lost");
    Ok(0)
}

fn write_to_cache(cache: Option<&CacheFile>, payloads: &[ScrobblePayload]) -> Result<bool, CacheError> {
    let Some(cache) = cache else {
        return Ok(false);
    };
    cache.write(payloads)?;
    Ok(true)
}
