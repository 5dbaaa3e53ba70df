use std::thread;
use std::time::Duration;

use log::debug;

use crate::player::{PlayerLink, WatcherError};
use crate::scrobble::{Song, checkpoint};

pub const DEFAULT_SCROBBLE_POINT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// The track changed before reaching the checkpoint.
    Changed,
    /// Playback stopped, or the song or status lacked the data needed to decide.
    Aborted,
}

impl Eligibility {
    pub fn is_eligible(self) -> bool {
        self == Eligibility::Eligible
    }
}

/// Waits until the playing track has been listened to long enough to count.
#[derive(Debug, Clone)]
pub struct EligibilityTimer {
    scrobble_point: f64,
    interval: Duration,
}

impl EligibilityTimer {
    pub fn new(scrobble_point: f64, interval: Duration) -> Self {
        Self {
            scrobble_point,
            interval,
        }
    }

    /// Blocks until `song` reaches its checkpoint or stops being the playing track.
    pub fn wait<P: PlayerLink>(
        &self,
        player: &mut P,
        song: &Song,
    ) -> Result<Eligibility, WatcherError> {
        let Some(duration) = song.duration else {
            debug!("Song has no duration, not waiting for a checkpoint");
            return Ok(Eligibility::Aborted);
        };
        let checkpoint = checkpoint(duration, self.scrobble_point);
        debug!("Set checkpoint to {checkpoint} seconds");

        let status = player.current_status()?;
        let (Some(start_id), Some(mut elapsed)) = (status.track_id, status.elapsed) else {
            return Ok(Eligibility::Aborted);
        };

        while (elapsed as f64) < checkpoint {
            thread::sleep(self.interval);
            let status = player.current_status()?;
            let (Some(track_id), Some(now)) = (status.track_id, status.elapsed) else {
                debug!("Player stopped while waiting for the checkpoint");
                return Ok(Eligibility::Aborted);
            };
            if track_id != start_id {
                debug!("Track changed at {elapsed}s, before the {checkpoint}s checkpoint");
                return Ok(Eligibility::Changed);
            }
            elapsed = now;
        }

        debug!("Passed the checkpoint at {elapsed}s");
        Ok(Eligibility::Eligible)
    }
}
