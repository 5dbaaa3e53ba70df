//! Scripted stand-ins for the player and the scrobbling service.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::player::{ConnectionError, PlaybackStatus, PlayerError, PlayerLink};
use crate::scrobble::{ScrobblePayload, Song, Track};
use crate::service::{RemoteError, RemoteReporter, submit_in_chunks};

pub fn song(artist: &str, title: &str, duration: u64) -> Song {
    Song {
        artist: Some(artist.to_string()),
        title: Some(title.to_string()),
        album: None,
        album_artist: None,
        duration: Some(duration),
    }
}

pub fn playing(track_id: u32, elapsed: u64) -> PlaybackStatus {
    PlaybackStatus {
        track_id: Some(track_id),
        elapsed: Some(elapsed),
    }
}

/// Replays scripted statuses in order and repeats the last one once the script runs out.
#[derive(Default)]
pub struct FakePlayer {
    statuses: VecDeque<PlaybackStatus>,
    current: PlaybackStatus,
    songs: HashMap<u32, Song>,
    fallback_song: Option<Song>,
    failing_song_reads: usize,
    refuse_connections: bool,
    connects: usize,
    idles_left: usize,
    watching: Option<Arc<AtomicBool>>,
    last_poll: Option<Instant>,
}

impl FakePlayer {
    pub fn with_statuses(statuses: impl IntoIterator<Item = PlaybackStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn add_song(&mut self, track_id: u32, song: Song) {
        self.songs.insert(track_id, song);
    }

    pub fn set_song(&mut self, song: Option<Song>) {
        self.fallback_song = song;
    }

    pub fn fail_song_reads(&mut self, count: usize) {
        self.failing_song_reads = count;
    }

    pub fn refuse_connections(&mut self) {
        self.refuse_connections = true;
    }

    /// When the status was last read.
    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    pub fn reconnects(&self) -> usize {
        self.connects
    }

    /// Allows `idles` change notifications, then clears `watching` on the next idle.
    pub fn stop_after(&mut self, idles: usize, watching: Arc<AtomicBool>) {
        self.idles_left = idles;
        self.watching = Some(watching);
    }
}

impl PlayerLink for FakePlayer {
    fn connect(&mut self) -> Result<(), ConnectionError> {
        self.connects += 1;
        if self.refuse_connections {
            return Err(ConnectionError::Transport {
                host: "fake".to_string(),
                source: PlayerError::NotConnected,
            });
        }
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn idle(&mut self) -> Result<(), PlayerError> {
        if self.idles_left == 0 {
            if let Some(watching) = &self.watching {
                watching.store(false, Ordering::SeqCst);
            }
            return Ok(());
        }
        self.idles_left -= 1;
        Ok(())
    }

    fn status(&mut self) -> Result<PlaybackStatus, PlayerError> {
        self.last_poll = Some(Instant::now());
        if let Some(next) = self.statuses.pop_front() {
            self.current = next;
        }
        Ok(self.current)
    }

    fn song(&mut self) -> Result<Option<Song>, PlayerError> {
        if self.failing_song_reads > 0 {
            self.failing_song_reads -= 1;
            return Err(PlayerError::NotConnected);
        }
        let song = self
            .current
            .track_id
            .and_then(|id| self.songs.get(&id).cloned());
        Ok(song.or_else(|| self.fallback_song.clone()))
    }
}

#[derive(Default)]
struct ReporterState {
    failing: bool,
    /// (chunk size, chunks accepted before failing)
    chunked: Option<(usize, usize)>,
    now_playing: Vec<Track>,
    batches: Vec<Vec<ScrobblePayload>>,
}

/// Records successful calls; clones share the same record.
#[derive(Clone, Default)]
pub struct FakeReporter {
    state: Arc<Mutex<ReporterState>>,
}

impl FakeReporter {
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Splits batches into chunks of `size` and fails every chunk after the first `accepted`.
    pub fn fail_after_chunks(&self, size: usize, accepted: usize) {
        self.state.lock().unwrap().chunked = Some((size, accepted));
    }

    pub fn now_playing(&self) -> Vec<Track> {
        self.state.lock().unwrap().now_playing.clone()
    }

    pub fn batches(&self) -> Vec<Vec<ScrobblePayload>> {
        self.state.lock().unwrap().batches.clone()
    }
}

impl RemoteReporter for FakeReporter {
    fn report_now_playing(&self, track: &Track) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(RemoteError::Malformed("service unavailable".to_string()));
        }
        state.now_playing.push(track.clone());
        Ok(())
    }

    fn report_batch(&self, payloads: &[ScrobblePayload]) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(RemoteError::Malformed("service unavailable".to_string()));
        }
        let Some((size, accepted)) = state.chunked else {
            state.batches.push(payloads.to_vec());
            return Ok(());
        };
        submit_in_chunks(payloads, size, |chunk| {
            if state.batches.len() >= accepted {
                return Err(RemoteError::Malformed("service unavailable".to_string()));
            }
            state.batches.push(chunk.to_vec());
            Ok(())
        })
    }
}
