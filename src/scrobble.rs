use serde::{Deserialize, Serialize};

pub const LONG_TRACK_SECONDS: u64 = 480;
pub const LONG_TRACK_CHECKPOINT: f64 = 240.0;

/// Metadata for the current song, as the player reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Song {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub artist: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl Track {
    /// Returns `None` unless the song carries both an artist and a title.
    pub fn from_song(song: &Song) -> Option<Self> {
        let artist = song.artist.clone().filter(|value| !value.is_empty())?;
        let title = song.title.clone().filter(|value| !value.is_empty())?;
        Some(Self {
            artist,
            title,
            album: song.album.clone().filter(|value| !value.is_empty()),
            album_artist: song.album_artist.clone().filter(|value| !value.is_empty()),
            duration: song.duration.filter(|seconds| *seconds > 0),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrobblePayload {
    #[serde(flatten)]
    pub track: Track,
    pub timestamp: i64,
}

impl ScrobblePayload {
    pub fn new(track: Track, timestamp: i64) -> Self {
        Self { track, timestamp }
    }
}

/// Seconds of playback needed before a track of `duration` seconds counts as played.
pub fn checkpoint(duration: u64, scrobble_point: f64) -> f64 {
    if duration >= LONG_TRACK_SECONDS {
        return LONG_TRACK_CHECKPOINT;
    }
    duration as f64 * scrobble_point
}
