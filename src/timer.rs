//! Timer scheduler.
//!
//! Each registered timer runs on its own task and fires at
//! `last_fire + interval`. A firing that comes due while the previous
//! run is still executing is skipped and counted as a missed tick; a
//! timer never has more than one invocation in flight. When an execution
//! overruns its interval by more than `max_drift`, the schedule is reset
//! to `now + interval` (drift is reset, not accumulated) and a drift
//! event is recorded.
//!
//! Timer errors are logged with correlation context and recorded in the
//! stats; they never stop the scheduler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::correlation;

/// Error type produced by timer bodies.
pub type TimerBodyError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased timer body.
pub type TimerBody = Arc<dyn Fn() -> BoxFuture<'static, Result<(), TimerBodyError>> + Send + Sync>;

/// Schedule of one timer.
#[derive(Debug, Clone, Copy)]
pub struct TimerSpec {
    /// Time between fires; must be greater than zero.
    pub interval: Duration,
    /// Fire once at start instead of waiting a full interval.
    pub eager: bool,
    /// Tolerated execution overrun before the schedule is reset.
    pub max_drift: Duration,
}

impl TimerSpec {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            eager: false,
            max_drift: Duration::ZERO,
        }
    }

    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    pub fn max_drift(mut self, max_drift: Duration) -> Self {
        self.max_drift = max_drift;
        self
    }
}

/// Wrap a blocking closure as a timer body running on a worker thread,
/// so the scheduler loop is never blocked.
pub fn blocking_body<F>(f: F) -> TimerBody
where
    F: Fn() -> Result<(), TimerBodyError> + Send + Sync + Clone + 'static,
{
    Arc::new(move || {
        let f = f.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || f())
                .await
                .map_err(|e| Box::new(e) as TimerBodyError)?
        })
    })
}

/// Live counters of one timer; shared between the scheduler task and
/// stats readers.
#[derive(Debug, Default)]
pub struct TimerStats {
    execution_count: AtomicU64,
    error_count: AtomicU64,
    missed_ticks: AtomicU64,
    drift_resets: AtomicU64,
    total_latency_us: AtomicU64,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl TimerStats {
    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn missed_ticks(&self) -> u64 {
        self.missed_ticks.load(Ordering::Relaxed)
    }

    pub fn drift_resets(&self) -> u64 {
        self.drift_resets.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn record_execution(&self, latency: Duration) {
        self.execution_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_error(&self, message: String) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
    }

    /// Point-in-time snapshot for the stats surface.
    pub fn snapshot(&self, name: &str, spec: &TimerSpec) -> TimerSnapshot {
        let executions = self.execution_count();
        let mean_latency_ms = if executions > 0 {
            (self.total_latency_us.load(Ordering::Relaxed) as f64 / executions as f64) / 1000.0
        } else {
            0.0
        };
        TimerSnapshot {
            name: name.to_string(),
            interval_ms: spec.interval.as_millis() as u64,
            eager: spec.eager,
            is_running: self.is_running(),
            execution_count: executions,
            error_count: self.error_count(),
            missed_ticks: self.missed_ticks(),
            drift_resets: self.drift_resets(),
            mean_latency_ms,
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }
}

/// Serializable view of one timer's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TimerSnapshot {
    pub name: String,
    pub interval_ms: u64,
    pub eager: bool,
    pub is_running: bool,
    pub execution_count: u64,
    pub error_count: u64,
    pub missed_ticks: u64,
    pub drift_resets: u64,
    pub mean_latency_ms: f64,
    pub last_error: Option<String>,
}

/// Scheduler loop for one timer. Runs until the shutdown signal fires.
pub(crate) async fn run_timer(
    name: String,
    spec: TimerSpec,
    body: TimerBody,
    stats: Arc<TimerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = spec.interval;
    let mut next = if spec.eager {
        Instant::now()
    } else {
        Instant::now() + interval
    };

    stats.running.store(true, Ordering::Relaxed);
    debug!(timer = %name, interval_ms = interval.as_millis() as u64, eager = spec.eager, "Timer started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep_until(next) => {}
        }

        let correlation_id = correlation::mint();
        let started = Instant::now();
        let result = correlation::with_correlation(correlation_id.clone(), body()).await;
        let elapsed = started.elapsed();
        stats.record_execution(elapsed);

        #[cfg(feature = "otel")]
        crate::metrics::TIMER_EXECUTION_TOTAL.add(
            1,
            &[crate::metrics::outcome_attr(if result.is_ok() {
                "ok"
            } else {
                "error"
            })],
        );

        if let Err(e) = result {
            stats.record_error(e.to_string());
            error!(
                timer = %name,
                correlation_id = %correlation_id,
                error = %e,
                "Timer execution failed"
            );
        }

        next += interval;
        let now = Instant::now();
        if next <= now {
            let overrun = elapsed.saturating_sub(interval);
            if overrun > spec.max_drift {
                // Reset the phase rather than chasing the backlog.
                let behind = ((now - next).as_nanos() / interval.as_nanos().max(1)) as u64 + 1;
                stats.missed_ticks.fetch_add(behind, Ordering::Relaxed);
                stats.drift_resets.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timer = %name,
                    overrun_ms = overrun.as_millis() as u64,
                    missed = behind,
                    "Timer overran max_drift, resetting schedule"
                );
                next = now + interval;
            } else {
                // Make up one overdue fire immediately; skip the rest.
                while next + interval <= now {
                    next += interval;
                    stats.missed_ticks.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    stats.running.store(false, Ordering::Relaxed);
    debug!(timer = %name, "Timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_body(count: Arc<AtomicUsize>, delay: Duration) -> TimerBody {
        Arc::new(move || {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(())
            })
        })
    }

    fn spawn_timer(
        spec: TimerSpec,
        body: TimerBody,
    ) -> (Arc<TimerStats>, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let stats = Arc::new(TimerStats::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_timer(
            "test".to_string(),
            spec,
            body,
            stats.clone(),
            rx,
        ));
        (stats, tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_eager_timer_fires_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let spec = TimerSpec::new(Duration::from_millis(100)).eager();
        let (stats, tx, handle) = spawn_timer(spec, counting_body(count.clone(), Duration::ZERO));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(stats.execution_count(), 1);
        assert!(!stats.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_timer_waits_one_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let spec = TimerSpec::new(Duration::from_millis(100));
        let (_stats, tx, handle) = spawn_timer(spec, counting_body(count.clone(), Duration::ZERO));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_execution_at_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let spec = TimerSpec::new(Duration::from_millis(50));
        let (_stats, tx, handle) = spawn_timer(spec, counting_body(count.clone(), Duration::ZERO));

        tokio::time::sleep(Duration::from_millis(260)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_body_records_missed_ticks_without_overlap() {
        let count = Arc::new(AtomicUsize::new(0));
        // Body takes 120ms against a 50ms interval; tolerate the overrun
        // so the schedule catches up instead of resetting.
        let spec = TimerSpec::new(Duration::from_millis(50)).max_drift(Duration::from_millis(500));
        let (stats, tx, handle) =
            spawn_timer(spec, counting_body(count.clone(), Duration::from_millis(120)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Fires at ~50, ~170, ~290, ~410: single-flight, no overlap.
        let executions = stats.execution_count();
        assert!((4..=5).contains(&executions), "executions = {}", executions);
        assert!(stats.missed_ticks() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_beyond_max_drift_resets_schedule() {
        let count = Arc::new(AtomicUsize::new(0));
        // Zero drift tolerance: every overrun resets the phase.
        let spec = TimerSpec::new(Duration::from_millis(50));
        let (stats, tx, handle) =
            spawn_timer(spec, counting_body(count.clone(), Duration::from_millis(120)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Fires at ~50, ~220, ~390: each run resets to completion + interval.
        assert!(stats.drift_resets() > 0);
        assert!(stats.execution_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let failing_count = count.clone();
        let body: TimerBody = Arc::new(move || {
            let n = failing_count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < 2 {
                    Err("boom".into())
                } else {
                    Ok(())
                }
            })
        });

        let spec = TimerSpec::new(Duration::from_millis(20));
        let (stats, tx, handle) = spawn_timer(spec, body);

        tokio::time::sleep(Duration::from_millis(110)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(stats.error_count(), 2);
        assert!(stats.execution_count() > stats.error_count());
        let snapshot = stats.snapshot("failing", &spec);
        assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_blocking_body_runs_off_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let body_count = count.clone();
        let body = blocking_body(move || {
            body_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let spec = TimerSpec::new(Duration::from_millis(10)).eager();
        let (_stats, tx, handle) = spawn_timer(spec, body);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_fires() {
        let count = Arc::new(AtomicUsize::new(0));
        let spec = TimerSpec::new(Duration::from_millis(100));
        let (stats, tx, handle) = spawn_timer(spec, counting_body(count.clone(), Duration::ZERO));

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(stats.execution_count(), 0);
        assert!(!stats.is_running());
    }
}
