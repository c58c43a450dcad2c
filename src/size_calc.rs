//! Throttled background recomputation of cached subtree sizes.
//!
//! One dedicated thread drains a de-duplicated queue. After spending `D` on
//! an item it pauses for `D × (1/max_load − 1)`, which caps its share of
//! wall-clock time at `max_load`.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::Watchdog;
use crate::config::ConfigHandle;
use crate::error::RepoResult;

/// Something whose cached sizes can be recomputed.
pub trait SizeCalcTarget: Send + Sync {
    /// Queue key; two targets with the same location are the same work.
    fn location(&self) -> &Path;

    fn recalculate(&self) -> RepoResult<()>;
}

/// Longest pause after one item, whatever the load.
pub const MAX_SLEEP: Duration = Duration::from_secs(60 * 60);

/// Pause owed after spending `spent` on one item, at most [`MAX_SLEEP`].
pub fn sleep_time(spent: Duration, max_load: f32) -> Duration {
    if !(max_load > 0.0 && max_load < 1.0) {
        return Duration::ZERO;
    }
    let factor = 1.0 / f64::from(max_load) - 1.0;
    if spent.as_secs_f64() * factor >= MAX_SLEEP.as_secs_f64() {
        return MAX_SLEEP;
    }
    spent.mul_f64(factor)
}

/// FIFO with set semantics, keyed by location.
#[derive(Default)]
pub(crate) struct SizeCalcQueue {
    items: VecDeque<Arc<dyn SizeCalcTarget>>,
    queued: HashSet<PathBuf>,
    stop: bool,
}

impl SizeCalcQueue {
    /// Returns false if the target was already queued.
    pub fn push(&mut self, target: Arc<dyn SizeCalcTarget>) -> bool {
        if !self.queued.insert(target.location().to_path_buf()) {
            return false;
        }
        self.items.push_back(target);
        true
    }

    pub fn pop(&mut self) -> Option<Arc<dyn SizeCalcTarget>> {
        let item = self.items.pop_front()?;
        self.queued.remove(item.location());
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

struct Shared {
    queue: Mutex<SizeCalcQueue>,
    wakeup: Condvar,
    config: Arc<ConfigHandle>,
    watchdog: Arc<dyn Watchdog>,
}

pub struct BackgroundSizeCalculator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundSizeCalculator {
    pub fn new(config: Arc<ConfigHandle>, watchdog: Arc<dyn Watchdog>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(SizeCalcQueue::default()),
                wakeup: Condvar::new(),
                config,
                watchdog,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queues `target`, starting the worker on first use. Returns false if
    /// it was already queued or the calculator has been shut down.
    pub fn enqueue(&self, target: Arc<dyn SizeCalcTarget>) -> bool {
        {
            let mut queue = self.shared.queue.lock();
            if queue.stop {
                debug!(location = %target.location().display(), "size calc stopped, not queueing");
                return false;
            }
            if !queue.push(target) {
                return false;
            }
        }
        self.shared.wakeup.notify_one();
        self.ensure_started();
        true
    }

    fn ensure_started(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("size_calc".to_string())
            .spawn(move || run(shared))
        {
            Ok(handle) => {
                info!("started size calc thread");
                *worker = Some(handle);
            }
            Err(e) => error!(error = %e, "couldn't start size calc thread"),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stops the worker and waits for it. Queued work is dropped.
    pub fn shutdown(&self) {
        self.shared.queue.lock().stop = true;
        self.shared.wakeup.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("size calc thread panicked");
            }
        }
    }
}

impl Drop for BackgroundSizeCalculator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reports an exit the worker didn't ask for (a panic) unless disarmed.
struct ExitGuard {
    watchdog: Arc<dyn Watchdog>,
    armed: bool,
}

impl ExitGuard {
    fn arm(watchdog: Arc<dyn Watchdog>) -> Self {
        watchdog.set_trigger_on_exit(true);
        Self {
            watchdog,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.watchdog.set_trigger_on_exit(false);
        self.armed = false;
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.armed {
            self.watchdog.exited();
        }
    }
}

fn run(shared: Arc<Shared>) {
    let guard = ExitGuard::arm(shared.watchdog.clone());
    loop {
        shared.watchdog.poke();
        let config = shared.config.current();
        let idle = config
            .size_calc_idle_timeout
            .min(config.size_calc_watchdog_interval);

        let item = {
            let mut queue = shared.queue.lock();
            if !queue.stop && queue.len() == 0 {
                shared.wakeup.wait_for(&mut queue, idle);
            }
            if queue.stop {
                break;
            }
            queue.pop()
        };
        let Some(item) = item else {
            continue;
        };

        let started = Instant::now();
        if let Err(e) = item.recalculate() {
            warn!(location = %item.location().display(), error = %e, "size calc failed, skipping");
        }
        drop(item);

        let pause = sleep_time(started.elapsed(), config.size_calc_max_load);
        if pause.is_zero() {
            continue;
        }
        let deadline = Instant::now() + pause;
        let mut queue = shared.queue.lock();
        while !queue.stop && Instant::now() < deadline {
            shared.wakeup.wait_until(&mut queue, deadline);
        }
        if queue.stop {
            break;
        }
    }
    debug!("size calc thread stopping");
    guard.disarm();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::RepositoryConfig;
    use crate::error::RepoError;

    #[derive(Default)]
    struct RecordingWatchdog {
        events: Mutex<Vec<&'static str>>,
    }

    impl Watchdog for RecordingWatchdog {
        fn poke(&self) {
            self.events.lock().push("poke");
        }

        fn set_trigger_on_exit(&self, armed: bool) {
            self.events.lock().push(if armed { "arm" } else { "disarm" });
        }

        fn exited(&self) {
            self.events.lock().push("exited");
        }
    }

    struct Counted {
        location: PathBuf,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl SizeCalcTarget for Counted {
        fn location(&self) -> &Path {
            &self.location
        }

        fn recalculate(&self) -> RepoResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RepoError::StateFault("boom".into()));
            }
            Ok(())
        }
    }

    fn target(path: &str, runs: &Arc<AtomicUsize>, fail: bool) -> Arc<dyn SizeCalcTarget> {
        Arc::new(Counted {
            location: PathBuf::from(path),
            runs: runs.clone(),
            fail,
        })
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_sleep_time() {
        let spent = Duration::from_millis(100);
        assert_eq!(sleep_time(spent, 0.5), Duration::from_millis(100));
        assert_eq!(sleep_time(spent, 0.25), Duration::from_millis(300));
        assert_eq!(sleep_time(spent, 1.0), Duration::ZERO);
    }

    #[test]
    fn test_sleep_time_tiny_load() {
        assert_eq!(sleep_time(Duration::from_secs(1), f32::MIN_POSITIVE), MAX_SLEEP);
        assert_eq!(sleep_time(Duration::from_secs(1), f32::from_bits(1)), MAX_SLEEP);
        assert_eq!(sleep_time(Duration::from_secs(3600), 0.01), MAX_SLEEP);
        assert_eq!(sleep_time(Duration::ZERO, f32::from_bits(1)), Duration::ZERO);
    }

    #[test]
    fn test_queue_set_semantics() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut queue = SizeCalcQueue::default();
        assert!(queue.push(target("/a", &runs, false)));
        assert!(!queue.push(target("/a", &runs, false)));
        assert!(queue.push(target("/b", &runs, false)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().location(), Path::new("/a"));
        // popped, so queueable again
        assert!(queue.push(target("/a", &runs, false)));
    }

    #[test]
    fn test_drains_and_disarms_on_shutdown() {
        let mut config = RepositoryConfig::default();
        config.size_calc_max_load = 1.0;
        let watchdog = Arc::new(RecordingWatchdog::default());
        let calc = BackgroundSizeCalculator::new(
            Arc::new(ConfigHandle::new(config)),
            watchdog.clone(),
        );
        assert!(!calc.is_running());

        let runs = Arc::new(AtomicUsize::new(0));
        assert!(calc.enqueue(target("/a", &runs, true)));
        calc.enqueue(target("/b", &runs, false));
        assert!(calc.is_running());
        wait_until(|| runs.load(Ordering::SeqCst) == 2);

        calc.shutdown();
        assert!(!calc.is_running());
        assert!(!calc.enqueue(target("/c", &runs, false)));

        let events = watchdog.events.lock();
        assert_eq!(events.first(), Some(&"arm"));
        assert_eq!(events.last(), Some(&"disarm"));
        assert!(events.contains(&"poke"));
        assert!(!events.contains(&"exited"));
    }
}
