use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::eligibility::EligibilityTimer;
use crate::player::{PlayerLink, WatcherError};
use crate::queue::DeliveryQueue;
use crate::service::RemoteReporter;

pub const POLL_PAUSE: Duration = Duration::from_secs(1);

/// Follows the player, times every new track and hands finished plays to the delivery queue.
pub struct Watcher<P, R> {
    player: P,
    delivery: DeliveryQueue<R>,
    timer: EligibilityTimer,
    watching: Arc<AtomicBool>,
    pause: Duration,
}

impl<P: PlayerLink, R: RemoteReporter> Watcher<P, R> {
    pub fn new(player: P, delivery: DeliveryQueue<R>, timer: EligibilityTimer) -> Self {
        Self {
            player,
            delivery,
            timer,
            watching: Arc::new(AtomicBool::new(true)),
            pause: POLL_PAUSE,
        }
    }

    #[cfg(test)]
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Shared flag; clearing it ends the loop after the current iteration.
    pub fn watching(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.watching)
    }

    pub fn stop(&self) {
        self.watching.store(false, Ordering::SeqCst);
    }

    pub fn delivery(&self) -> &DeliveryQueue<R> {
        &self.delivery
    }

    pub fn player_mut(&mut self) -> &mut P {
        &mut self.player
    }

    pub fn watch(&mut self) -> Result<(), WatcherError> {
        info!("Watching the player for track changes");
        let mut last_status = self.player.current_status()?;

        while self.watching.load(Ordering::SeqCst) {
            self.player.wait_for_change()?;
            let status = self.player.current_status()?;

            if status.track_changed_from(&last_status) {
                debug!("Track changed: {:?} -> {:?}", last_status.track_id, status.track_id);
                self.track_changed()?;
            }

            last_status = status;
            thread::sleep(self.pause);
        }

        info!("Stopped watching the player");
        Ok(())
    }

    fn track_changed(&mut self) -> Result<(), WatcherError> {
        let song = self.player.current_track()?;
        self.delivery.now_playing_updated(song.as_ref());
        let Some(song) = song else {
            return Ok(());
        };

        let outcome = self.timer.wait(&mut self.player, &song)?;
        if outcome.is_eligible() {
            let timestamp = chrono::Utc::now().timestamp();
            self.delivery.enqueue(&song, timestamp);
        } else {
            debug!("Track not eligible for scrobbling: {outcome:?}");
        }
        Ok(())
    }
}
