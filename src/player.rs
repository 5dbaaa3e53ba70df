use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use mpd::idle::Subsystem;
use mpd::{Client, Idle};
use thiserror::Error;

use crate::scrobble::Song;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Mpd(#[from] mpd::error::Error),
    #[error("not connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Could not connect to '{host}': {source}")]
    Transport {
        host: String,
        #[source]
        source: PlayerError,
    },
    #[error("Could not connect to '{host}': password command failed: {source}")]
    Password {
        host: String,
        #[source]
        source: PlayerError,
    },
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Could not retrieve {what}: {source}")]
    Query {
        what: &'static str,
        #[source]
        source: PlayerError,
    },
    #[error("Reconnecting failed: {0}")]
    Reconnect(#[from] ConnectionError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStatus {
    /// Changes exactly when the playing track changes.
    pub track_id: Option<u32>,
    pub elapsed: Option<u64>,
}

impl PlaybackStatus {
    /// Stopping playback (no track id) does not count as a change.
    pub fn track_changed_from(&self, last: &PlaybackStatus) -> bool {
        self.track_id.is_some() && self.track_id != last.track_id
    }
}

/// Connection to the music player's control protocol.
///
/// Implementors provide the raw queries; the `wait_for_change`, `current_status`
/// and `current_track` wrappers reconnect once and retry before giving up.
pub trait PlayerLink {
    fn connect(&mut self) -> Result<(), ConnectionError>;

    /// Must leave the link safe to `connect` again, whatever state it was in.
    fn disconnect(&mut self);

    fn reconnect(&mut self) -> Result<(), ConnectionError> {
        self.disconnect();
        self.connect()
    }

    fn idle(&mut self) -> Result<(), PlayerError>;

    fn status(&mut self) -> Result<PlaybackStatus, PlayerError>;

    fn song(&mut self) -> Result<Option<Song>, PlayerError>;

    fn wait_for_change(&mut self) -> Result<(), WatcherError>
    where
        Self: Sized,
    {
        retry_once(self, "player events", Self::idle)
    }

    fn current_status(&mut self) -> Result<PlaybackStatus, WatcherError>
    where
        Self: Sized,
    {
        retry_once(self, "player status", Self::status)
    }

    fn current_track(&mut self) -> Result<Option<Song>, WatcherError>
    where
        Self: Sized,
    {
        retry_once(self, "current song", Self::song)
    }
}

fn retry_once<P, T>(
    player: &mut P,
    what: &'static str,
    mut query: impl FnMut(&mut P) -> Result<T, PlayerError>,
) -> Result<T, WatcherError>
where
    P: PlayerLink,
{
    match query(player) {
        Ok(value) => Ok(value),
        Err(err) => {
            debug!("Query for {what} failed ({err}), reconnecting");
            player.reconnect()?;
            query(player).map_err(|source| WatcherError::Query { what, source })
        }
    }
}

/// Closes the player socket from another thread, e.g. a signal handler.
#[derive(Debug, Clone, Default)]
pub struct Disconnector {
    stream: Arc<Mutex<Option<TcpStream>>>,
}

impl Disconnector {
    pub fn disconnect(&self) {
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stream) = stream {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                debug!("Could not shut down player socket: {err}");
            }
        }
    }

    pub(crate) fn replace(&self, stream: Option<TcpStream>) {
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = stream;
    }
}

pub struct MpdLink {
    host: String,
    port: u16,
    password: Option<String>,
    client: Option<Client<TcpStream>>,
    socket: Disconnector,
}

impl MpdLink {
    pub fn new(host: &str, port: u16, password: Option<&str>) -> Self {
        Self {
            host: host.to_string(),
            port,
            password: password.map(str::to_string),
            client: None,
            socket: Disconnector::default(),
        }
    }

    pub fn disconnector(&self) -> Disconnector {
        self.socket.clone()
    }

    fn client(&mut self) -> Result<&mut Client<TcpStream>, PlayerError> {
        self.client.as_mut().ok_or(PlayerError::NotConnected)
    }
}

impl PlayerLink for MpdLink {
    fn connect(&mut self) -> Result<(), ConnectionError> {
        info!("Connecting to MPD at {}:{}", self.host, self.port);
        let host = self.host.clone();
        let transport = |source: PlayerError| ConnectionError::Transport {
            host: host.clone(),
            source,
        };
        let stream =
            TcpStream::connect((self.host.as_str(), self.port)).map_err(|err| transport(err.into()))?;
        let handle = stream.try_clone().map_err(|err| transport(err.into()))?;
        let mut client = Client::new(stream).map_err(|err| transport(err.into()))?;
        if let Some(password) = &self.password {
            info!("Sending password to MPD");
            client
                .login(password)
                .map_err(|err| ConnectionError::Password {
                    host: host.clone(),
                    source: err.into(),
                })?;
        }
        self.socket.replace(Some(handle));
        self.client = Some(client);
        Ok(())
    }

    fn disconnect(&mut self) {
        info!("Disconnecting from MPD");
        if let Some(mut client) = self.client.take() {
            if let Err(err) = client.close() {
                debug!("Could not close MPD client: {err}");
            }
        }
        self.socket.disconnect();
    }

    fn idle(&mut self) -> Result<(), PlayerError> {
        debug!("Sending idle request to MPD");
        let changed = self.client()?.idle(&[Subsystem::Player])?.get()?;
        debug!("MPD reported changes: {changed:?}");
        Ok(())
    }

    fn status(&mut self) -> Result<PlaybackStatus, PlayerError> {
        let status = self.client()?.status()?;
        Ok(PlaybackStatus {
            track_id: status.song.map(|place| place.id.0),
            elapsed: status.elapsed.map(|elapsed| elapsed.as_secs()),
        })
    }

    fn song(&mut self) -> Result<Option<Song>, PlayerError> {
        debug!("Sending currentsong to MPD");
        Ok(self.client()?.currentsong()?.map(song_from_mpd))
    }
}

fn song_from_mpd(song: mpd::Song) -> Song {
    Song {
        album: tag_value(&song, "Album"),
        album_artist: tag_value(&song, "AlbumArtist"),
        duration: song.duration.map(|duration| duration.as_secs()),
        artist: song.artist,
        title: song.title,
    }
}

/// First value for `tag`; MPD repeats a tag once per value.
fn tag_value(song: &mpd::Song, tag: &str) -> Option<String> {
    song.tags
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(tag))
        .map(|(_, value)| value.clone())
}
