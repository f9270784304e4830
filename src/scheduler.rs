//! Periodic task scheduler.
//!
//! One dispatch thread drives four independent timers. A tick only hands the
//! check to a [`CheckSink`]; the sink is expected to push the real work onto
//! the task runner, so the dispatch thread never blocks on I/O.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledCheck {
    CacheClean,
    UpdateCheck,
    StatusProbe,
    RefreshUi,
}

impl ScheduledCheck {
    pub const ALL: [ScheduledCheck; 4] = [
        ScheduledCheck::CacheClean,
        ScheduledCheck::UpdateCheck,
        ScheduledCheck::StatusProbe,
        ScheduledCheck::RefreshUi,
    ];

    /// Whether the check also fires once as soon as the scheduler starts.
    pub fn fires_on_start(self) -> bool {
        !matches!(self, ScheduledCheck::RefreshUi)
    }
}

impl fmt::Display for ScheduledCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduledCheck::CacheClean => "cache-clean",
            ScheduledCheck::UpdateCheck => "update",
            ScheduledCheck::StatusProbe => "status",
            ScheduledCheck::RefreshUi => "refresh",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleIntervals {
    pub cache_clean: Duration,
    pub update_check: Duration,
    pub status_probe: Duration,
    pub refresh_ui: Duration,
}

impl Default for ScheduleIntervals {
    fn default() -> Self {
        Self {
            cache_clean: Duration::from_secs(60 * 60),
            update_check: Duration::from_secs(10 * 60),
            status_probe: Duration::from_secs(3),
            refresh_ui: Duration::from_secs(30),
        }
    }
}

impl ScheduleIntervals {
    pub fn interval(&self, check: ScheduledCheck) -> Duration {
        let interval = match check {
            ScheduledCheck::CacheClean => self.cache_clean,
            ScheduledCheck::UpdateCheck => self.update_check,
            ScheduledCheck::StatusProbe => self.status_probe,
            ScheduledCheck::RefreshUi => self.refresh_ui,
        };
        interval.max(MIN_INTERVAL)
    }
}

/// Receives ticks. Implementations must return quickly.
pub trait CheckSink: Send + Sync + 'static {
    fn dispatch(&self, check: ScheduledCheck);
}

impl<F> CheckSink for F
where
    F: Fn(ScheduledCheck) + Send + Sync + 'static,
{
    fn dispatch(&self, check: ScheduledCheck) {
        self(check)
    }
}

pub struct Scheduler {
    running: Arc<AtomicBool>,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts all four timers immediately.
    pub fn start(intervals: ScheduleIntervals, sink: Arc<dyn CheckSink>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let flag = Arc::clone(&running);

        let spawned = thread::Builder::new()
            .name("launcher-scheduler".into())
            .spawn(move || {
                let started = Instant::now();
                let mut timers = ScheduledCheck::ALL
                    .iter()
                    .map(|&check| {
                        let interval = intervals.interval(check);
                        let due = if check.fires_on_start() {
                            started
                        } else {
                            started + interval
                        };
                        (check, interval, due)
                    })
                    .collect::<Vec<_>>();

                loop {
                    let next_due = timers
                        .iter()
                        .map(|(_, _, due)| *due)
                        .min()
                        .unwrap_or(started);
                    let wait = next_due.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    let now = Instant::now();
                    for (check, interval, due) in timers.iter_mut() {
                        if *due > now {
                            continue;
                        }
                        if !flag.load(Ordering::SeqCst) {
                            return;
                        }
                        trace!(check = %check, "scheduled tick");
                        sink.dispatch(*check);
                        *due += *interval;
                        if *due <= now {
                            *due = now + *interval;
                        }
                    }
                }
                debug!("scheduler thread exited");
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to spawn scheduler thread");
                running.store(false, Ordering::SeqCst);
                None
            }
        };

        Self {
            running,
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops every timer. No tick is dispatched after this returns; calling it
    /// again does nothing.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.stop_tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
        let handle = self.handle.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        debug!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
