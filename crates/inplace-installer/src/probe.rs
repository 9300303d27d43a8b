use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Reports whether the party that requested an operation has gone away.
pub trait ConnectionMonitor {
    fn is_abandoned(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttachedConnection;

impl ConnectionMonitor for AttachedConnection {
    fn is_abandoned(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct AbandonFlag(Arc<AtomicBool>);

impl AbandonFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_abandoned(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ConnectionMonitor for AbandonFlag {
    fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub elapsed: f64,
    pub requested: f64,
    pub completed: bool,
    pub abandoned: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticProbe {
    yield_interval: Duration,
}

impl DiagnosticProbe {
    pub fn new(yield_interval: Duration) -> Self {
        Self {
            yield_interval: yield_interval.max(Duration::from_millis(1)),
        }
    }

    /// Keeps the thread busy for `requested`, yielding every interval. An
    /// abandoned connection is noted but does not stop the wait.
    pub fn run<F>(
        &self,
        requested: Duration,
        monitor: &dyn ConnectionMonitor,
        mut on_tick: F,
    ) -> ProbeReport
    where
        F: FnMut(Duration),
    {
        let started = Instant::now();
        let mut abandoned = false;
        let mut spins = 0_u64;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= requested {
                break;
            }
            let slice_end = elapsed + self.yield_interval.min(requested - elapsed);
            while started.elapsed() < slice_end {
                spins = spins.wrapping_add(1);
                std::hint::spin_loop();
            }
            thread::yield_now();
            if !abandoned && monitor.is_abandoned() {
                abandoned = true;
                tracing::warn!(
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "probe caller went away; continuing"
                );
            }
            on_tick(started.elapsed());
        }
        tracing::debug!(spins, "probe finished");

        let elapsed = started.elapsed();
        ProbeReport {
            elapsed: elapsed.as_secs_f64(),
            requested: requested.as_secs_f64(),
            completed: elapsed >= requested,
            abandoned,
        }
    }
}
