//! Heartbeat and stall monitor
//!
//! A timer task that watches the time since the server last sent bytes.
//! Read timeouts refresh the read loop's own activity clock but never this
//! one, so a silent server always reaches the heartbeat and stall limits.
//! The task never yields events itself: it only fills a pending slot and wakes the
//! read loop, which delivers the synthetic event at its next iteration.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Heartbeat timing configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Check period, and the inactivity after which a progress notice is due
    pub interval: Duration,
    /// Inactivity after which the attempt is abandoned
    pub max_inactive: Duration,
    /// Minimum spacing between two progress notices
    pub progress_cooldown: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_inactive: Duration::from_secs(10 * 60),
            progress_cooldown: Duration::from_secs(15),
        }
    }
}

/// Event requested by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synthetic {
    /// Still waiting on the server
    Progress { inactive: Duration },
    /// Waited too long; the attempt must end
    StallTimeout { inactive: Duration },
}

#[derive(Debug)]
struct ActivityState {
    last_activity: Instant,
    last_data: Instant,
    last_progress: Option<Instant>,
    pending: Option<Synthetic>,
}

/// Activity shared between the read loop (writer) and the monitor (reader)
#[derive(Debug, Clone)]
pub struct ConnectionActivity {
    state: Arc<Mutex<ActivityState>>,
    wake: Arc<Notify>,
    config: HeartbeatConfig,
}

impl ConnectionActivity {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(ActivityState {
                last_activity: Instant::now(),
                last_data: Instant::now(),
                last_progress: None,
                pending: None,
            })),
            wake: Arc::new(Notify::new()),
            config,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Refresh the read loop's activity clock without counting it as data
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Bytes arrived from the server
    pub fn record_data(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.last_activity = now;
        state.last_data = now;
    }

    /// Time since the last recorded activity
    pub fn inactive_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    /// Time since the server last sent bytes
    pub fn silent_for(&self) -> Duration {
        self.state.lock().last_data.elapsed()
    }

    /// Take the pending synthetic event, if any
    pub fn take_pending(&self) -> Option<Synthetic> {
        self.state.lock().pending.take()
    }

    /// Resolves once the monitor has filled the pending slot
    pub async fn pending_ready(&self) {
        self.wake.notified().await;
    }

    /// Run one monitor check at `now`. Returns true when the stall limit was
    /// exceeded.
    pub fn check(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let inactive = now.saturating_duration_since(state.last_data);
        tracing::debug!("Heartbeat check: {:.1}s since last data", inactive.as_secs_f64());

        let mut notify = false;
        let cooled_down = state
            .last_progress
            .is_none_or(|at| now.saturating_duration_since(at) > self.config.progress_cooldown);
        if inactive > self.config.interval && cooled_down {
            state.pending = Some(Synthetic::Progress { inactive });
            state.last_progress = Some(now);
            notify = true;
        }

        let stalled = inactive > self.config.max_inactive;
        if stalled {
            state.pending = Some(Synthetic::StallTimeout { inactive });
            notify = true;
        }
        drop(state);

        if notify {
            self.wake.notify_one();
        }
        stalled
    }
}

/// Handle to the running monitor task; the task stops when this is dropped
#[derive(Debug)]
pub struct HeartbeatMonitor {
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Start checking `activity` every heartbeat interval. On a stall the
    /// pending slot is filled first, then `cancel` is triggered.
    pub fn spawn(activity: ConnectionActivity, cancel: CancellationToken) -> Self {
        let period = activity.config().interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if activity.check(Instant::now()) {
                            tracing::warn!(
                                "No activity for {:?}, abandoning stream",
                                activity.config().max_inactive
                            );
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });
        Self { handle }
    }

    /// Stop the monitor. Safe to call more than once.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(30),
            max_inactive: Duration::from_secs(120),
            progress_cooldown: Duration::from_secs(15),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_thresholds() {
        let activity = ConnectionActivity::new(config());
        let start = Instant::now();

        assert!(!activity.check(start + Duration::from_secs(30)));
        assert_eq!(activity.take_pending(), None);

        assert!(!activity.check(start + Duration::from_secs(31)));
        assert_eq!(
            activity.take_pending(),
            Some(Synthetic::Progress {
                inactive: Duration::from_secs(31)
            })
        );

        // Inside the cooldown window nothing new is queued
        assert!(!activity.check(start + Duration::from_secs(40)));
        assert_eq!(activity.take_pending(), None);

        assert!(activity.check(start + Duration::from_secs(121)));
        assert!(matches!(
            activity.take_pending(),
            Some(Synthetic::StallTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_resets_inactivity() {
        let activity = ConnectionActivity::new(config());
        tokio::time::advance(Duration::from_secs(25)).await;
        activity.record_data();
        assert_eq!(activity.inactive_for(), Duration::ZERO);
        assert_eq!(activity.silent_for(), Duration::ZERO);
        assert!(!activity.check(Instant::now() + Duration::from_secs(29)));
        assert_eq!(activity.take_pending(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_does_not_hide_silence() {
        let activity = ConnectionActivity::new(config());
        tokio::time::advance(Duration::from_secs(25)).await;
        activity.touch();
        assert_eq!(activity.inactive_for(), Duration::ZERO);
        assert_eq!(activity.silent_for(), Duration::from_secs(25));

        // Silence is measured from the last data, not the last touch
        assert!(!activity.check(Instant::now() + Duration::from_secs(10)));
        assert_eq!(
            activity.take_pending(),
            Some(Synthetic::Progress {
                inactive: Duration::from_secs(35)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_task_cancels_on_stall() {
        let activity = ConnectionActivity::new(config());
        let cancel = CancellationToken::new();
        let _monitor = HeartbeatMonitor::spawn(activity.clone(), cancel.clone());
        let start = Instant::now();

        activity.pending_ready().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(matches!(activity.take_pending(), Some(Synthetic::Progress { .. })));

        cancel.cancelled().await;
        assert!(start.elapsed() >= Duration::from_secs(120));
        assert!(matches!(
            activity.take_pending(),
            Some(Synthetic::StallTimeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_monitor_stays_quiet() {
        let activity = ConnectionActivity::new(config());
        let cancel = CancellationToken::new();
        let monitor = HeartbeatMonitor::spawn(activity.clone(), cancel.clone());
        monitor.stop();
        monitor.stop();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(activity.take_pending(), None);
        assert!(!cancel.is_cancelled());
    }
}
