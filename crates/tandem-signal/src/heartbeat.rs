//! Liveness monitor
//!
//! Each connected peer gets a periodic task that probes it with `ping`.
//! `pong` only refreshes the last-ack time; the probe cadence never
//! depends on when acks arrive. A tick that finds the last ack older than
//! `max_missed × interval` reports the peer as expired instead of probing,
//! so a dead socket is detected at most one interval after the threshold.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::peer::PeerId;

/// What a heartbeat tick asks the owner to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Send a `ping`
    Probe,
    /// No ack within the threshold, tear the peer down
    Expired,
}

struct Beat {
    connection: u64,
    last_ack: Instant,
    task: Option<AbortHandle>,
}

/// Heartbeat bookkeeping for every connected peer
pub struct LivenessMonitor {
    interval: Duration,
    max_missed: u32,
    beats: Arc<DashMap<PeerId, Beat>>,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed,
            beats: Arc::new(DashMap::new()),
        }
    }

    /// Silence tolerated before a peer is evicted
    pub fn threshold(&self) -> Duration {
        self.interval * self.max_missed
    }

    /// Start the heartbeat task for one connection
    ///
    /// `on_tick` runs on the heartbeat task; after it receives `Expired`
    /// the task ends. Starting again for the same peer replaces the old task.
    pub fn start<F>(&self, peer_id: &str, connection: u64, on_tick: F)
    where
        F: Fn(Liveness) + Send + Sync + 'static,
    {
        let previous = self.beats.insert(
            peer_id.to_string(),
            Beat {
                connection,
                last_ack: Instant::now(),
                task: None,
            },
        );
        if let Some(task) = previous.and_then(|beat| beat.task) {
            task.abort();
        }

        let beats = self.beats.clone();
        let id = peer_id.to_string();
        let period = self.interval;
        let threshold = self.threshold();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let last_ack = match beats.get(&id) {
                    Some(beat) if beat.connection == connection => beat.last_ack,
                    _ => return,
                };
                if last_ack.elapsed() > threshold {
                    debug!("Peer {} missed heartbeats for {:?}", id, last_ack.elapsed());
                    on_tick(Liveness::Expired);
                    return;
                }
                on_tick(Liveness::Probe);
            }
        });

        match self.beats.get_mut(peer_id) {
            Some(mut beat) if beat.connection == connection => {
                beat.task = Some(handle.abort_handle());
            }
            // Stopped before the handle could be recorded
            _ => handle.abort(),
        }
    }

    /// Record a `pong`
    pub fn ack(&self, peer_id: &str, connection: u64) {
        if let Some(mut beat) = self.beats.get_mut(peer_id) {
            if beat.connection == connection {
                beat.last_ack = Instant::now();
            }
        }
    }

    /// Stop the heartbeat of one connection. Returns `false` if already stopped.
    pub fn stop(&self, peer_id: &str, connection: u64) -> bool {
        match self
            .beats
            .remove_if(peer_id, |_, beat| beat.connection == connection)
        {
            Some((_, beat)) => {
                if let Some(task) = beat.task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Number of monitored connections
    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<Liveness>>>, impl Fn(Liveness) + Send + Sync + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |event| sink.lock().unwrap().push(event))
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_every_interval() {
        let monitor = LivenessMonitor::new(Duration::from_secs(1), 5);
        let (events, on_tick) = recorder();
        monitor.start("p", 1, on_tick);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        // Ticks at 0s, 1s, 2s
        assert_eq!(*events.lock().unwrap(), vec![Liveness::Probe; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_threshold() {
        let monitor = LivenessMonitor::new(Duration::from_secs(1), 5);
        assert_eq!(monitor.threshold(), Duration::from_secs(5));
        let (events, on_tick) = recorder();
        monitor.start("p", 1, on_tick);

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(!events.lock().unwrap().contains(&Liveness::Expired));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let events = events.lock().unwrap().clone();
        // Probes at 0..=5s, expiry on the 6s tick
        assert_eq!(events.len(), 7);
        assert_eq!(events.last(), Some(&Liveness::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_keep_peer_alive() {
        let monitor = LivenessMonitor::new(Duration::from_secs(1), 5);
        let (events, on_tick) = recorder();
        monitor.start("p", 1, on_tick);

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            monitor.ack("p", 1);
        }
        assert!(!events.lock().unwrap().contains(&Liveness::Expired));
        assert_eq!(monitor.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_exactly_once() {
        let monitor = LivenessMonitor::new(Duration::from_secs(1), 5);
        let (events, on_tick) = recorder();
        monitor.start("p", 1, on_tick);
        tokio::task::yield_now().await;

        assert!(!monitor.stop("p", 2));
        assert!(monitor.stop("p", 1));
        assert!(!monitor.stop("p", 1));
        assert!(monitor.is_empty());

        let before = events.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(events.lock().unwrap().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_old_connection() {
        let monitor = LivenessMonitor::new(Duration::from_secs(1), 5);
        let (old_events, old_tick) = recorder();
        let (new_events, new_tick) = recorder();
        monitor.start("p", 1, old_tick);
        tokio::task::yield_now().await;
        monitor.start("p", 2, new_tick);

        monitor.ack("p", 1);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let old_count = old_events.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(old_events.lock().unwrap().len(), old_count);
        assert!(new_events.lock().unwrap().len() >= 4);
        assert_eq!(monitor.len(), 1);
    }
}
