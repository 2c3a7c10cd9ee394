use async_trait::async_trait;
use humantime::format_duration;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const STATS_DUMP_INTERVAL_SECS: f32 = 3600.0; //secs between showing stats
pub const IDLE_SLEEP_MILLIS: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    /// no info cycle has succeeded yet, every tick retries it
    ProbingInfo,
    /// every tick runs an update cycle
    Polling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// a previous cycle was still running
    Skipped,
    InfoFailed,
    /// the info cycle succeeded and was immediately followed by an update cycle
    Promoted { update_ok: bool },
    Updated { ok: bool },
}

/// The two kinds of work driven by the scheduler. Each returns whether the
/// cycle succeeded; failures are reported by the implementation itself.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn info_cycle(&self) -> bool;
    async fn update_cycle(&self) -> bool;
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    name: String,
    interval: Duration,
    state: Mutex<PollState>,
    in_flight: AtomicBool,
    last_update_ok: Mutex<Option<Instant>>,
    pub poll_ok: AtomicU64,
    pub poll_errors: AtomicU64,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            state: Mutex::new(PollState::ProbingInfo),
            in_flight: AtomicBool::new(false),
            last_update_ok: Mutex::new(None),
            poll_ok: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PollState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PollState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn count_update(&self, ok: bool) {
        if ok {
            *self
                .last_update_ok
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        }
        self.count(ok);
    }

    fn count(&self, ok: bool) {
        if ok {
            self.poll_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.poll_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs the work due for one timer tick. A tick arriving while an earlier
    /// cycle is still in flight does nothing.
    pub async fn tick<R: CycleRunner + ?Sized>(&self, runner: &R) -> TickOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("{}: previous cycle still running, skipping tick", self.name);
            return TickOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        match self.state() {
            PollState::ProbingInfo => {
                if !runner.info_cycle().await {
                    self.count(false);
                    return TickOutcome::InfoFailed;
                }
                self.count(true);
                info!("{}: device information obtained, starting polling", self.name);
                self.set_state(PollState::Polling);
                let update_ok = runner.update_cycle().await;
                self.count_update(update_ok);
                TickOutcome::Promoted { update_ok }
            }
            // update failures never demote back to probing
            PollState::Polling => {
                let ok = runner.update_cycle().await;
                self.count_update(ok);
                TickOutcome::Updated { ok }
            }
        }
    }

    fn dump_stats(&self, started: Instant) {
        let last_update = match *self
            .last_update_ok
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(t) => format!(
                "{} ago",
                format_duration(Duration::from_secs(t.elapsed().as_secs()))
            ),
            None => "never".into(),
        };
        info!(
            "{}: 📊 envoy query statistics: ok: {}, errors: {}, state: {:?}, last update: {}, running for: {}",
            self.name,
            self.poll_ok.load(Ordering::Relaxed),
            self.poll_errors.load(Ordering::Relaxed),
            self.state(),
            last_update,
            format_duration(Duration::from_secs(started.elapsed().as_secs())),
        );
    }

    /// Ticks immediately, then on a fixed grid of `interval` until `cancel` is
    /// raised. Grid points passing while a cycle runs are dropped, not queued.
    pub async fn run<R: CycleRunner + ?Sized>(&self, runner: &R, cancel: Arc<AtomicBool>) {
        info!(
            "{}: Starting task, refresh interval: {}",
            self.name,
            format_duration(self.interval)
        );
        let started = Instant::now();
        let mut stats_interval = Instant::now();
        let mut next_tick = Instant::now();

        loop {
            if cancel.load(Ordering::SeqCst) {
                debug!("{}: Got terminate signal from main", self.name);
                self.dump_stats(started);
                break;
            }

            if stats_interval.elapsed() > Duration::from_secs_f32(STATS_DUMP_INTERVAL_SECS) {
                stats_interval = Instant::now();
                self.dump_stats(started);
            }

            if Instant::now() >= next_tick {
                next_tick += self.interval;
                self.tick(runner).await;

                let mut skipped = 0;
                while next_tick <= Instant::now() {
                    next_tick += self.interval;
                    skipped += 1;
                }
                if skipped > 0 {
                    warn!(
                        "{}: cycle overran the refresh interval, {} tick(s) skipped",
                        self.name, skipped
                    );
                }
            }

            let idle = Instant::now() + Duration::from_millis(IDLE_SLEEP_MILLIS);
            tokio::time::sleep_until(idle.min(next_tick)).await;
        }
        info!("{}: task stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeRunner {
        info_ok: Vec<bool>,
        update_ok: Vec<bool>,
        info_calls: AtomicUsize,
        update_calls: AtomicUsize,
    }

    impl FakeRunner {
        fn new(info_ok: &[bool], update_ok: &[bool]) -> Self {
            Self {
                info_ok: info_ok.to_vec(),
                update_ok: update_ok.to_vec(),
                ..Default::default()
            }
        }

        // the last scripted answer repeats
        fn answer(script: &[bool], call: usize) -> bool {
            script
                .get(call)
                .or_else(|| script.last())
                .copied()
                .unwrap_or(true)
        }
    }

    #[async_trait]
    impl CycleRunner for FakeRunner {
        async fn info_cycle(&self) -> bool {
            let call = self.info_calls.fetch_add(1, Ordering::SeqCst);
            Self::answer(&self.info_ok, call)
        }

        async fn update_cycle(&self) -> bool {
            let call = self.update_calls.fetch_add(1, Ordering::SeqCst);
            Self::answer(&self.update_ok, call)
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new("test", Duration::from_secs(10))
    }

    #[tokio::test]
    async fn info_success_promotes_and_updates_immediately() {
        let scheduler = scheduler();
        let runner = FakeRunner::new(&[false, false, true], &[true]);

        assert_eq!(scheduler.tick(&runner).await, TickOutcome::InfoFailed);
        assert_eq!(scheduler.tick(&runner).await, TickOutcome::InfoFailed);
        assert_eq!(scheduler.state(), PollState::ProbingInfo);
        assert_eq!(runner.update_calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            scheduler.tick(&runner).await,
            TickOutcome::Promoted { update_ok: true }
        );
        assert_eq!(scheduler.state(), PollState::Polling);
        assert_eq!(runner.info_calls.load(Ordering::SeqCst), 3);
        assert_eq!(runner.update_calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.poll_errors.load(Ordering::Relaxed), 2);
        assert_eq!(scheduler.poll_ok.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn update_failures_never_demote() {
        let scheduler = scheduler();
        let runner = FakeRunner::new(&[true], &[false]);

        assert_eq!(
            scheduler.tick(&runner).await,
            TickOutcome::Promoted { update_ok: false }
        );
        for _ in 0..3 {
            assert_eq!(scheduler.tick(&runner).await, TickOutcome::Updated { ok: false });
            assert_eq!(scheduler.state(), PollState::Polling);
        }
        assert_eq!(runner.info_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.update_calls.load(Ordering::SeqCst), 4);
    }

    struct BlockingRunner {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CycleRunner for BlockingRunner {
        async fn info_cycle(&self) -> bool {
            self.entered.notify_one();
            self.release.notified().await;
            false
        }

        async fn update_cycle(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn tick_during_a_running_cycle_is_skipped() {
        let scheduler = Arc::new(scheduler());
        let runner = Arc::new(BlockingRunner {
            entered: Notify::new(),
            release: Notify::new(),
        });

        let first = {
            let scheduler = scheduler.clone();
            let runner = runner.clone();
            tokio::spawn(async move { scheduler.tick(runner.as_ref()).await })
        };
        runner.entered.notified().await;

        assert_eq!(scheduler.tick(runner.as_ref()).await, TickOutcome::Skipped);

        runner.release.notify_one();
        assert_eq!(first.await.unwrap(), TickOutcome::InfoFailed);

        // the guard is released once the cycle finishes
        let next = {
            let scheduler = scheduler.clone();
            let runner = runner.clone();
            tokio::spawn(async move { scheduler.tick(runner.as_ref()).await })
        };
        runner.entered.notified().await;
        runner.release.notify_one();
        assert_eq!(next.await.unwrap(), TickOutcome::InfoFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_immediately_then_every_interval() {
        let scheduler = Arc::new(scheduler());
        let runner = Arc::new(FakeRunner::new(&[false], &[true]));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = {
            let scheduler = scheduler.clone();
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(runner.as_ref(), cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.store(true, Ordering::SeqCst);
        worker.await.unwrap();

        // t = 0, 10, 20, 30
        assert_eq!(runner.info_calls.load(Ordering::SeqCst), 4);
        assert_eq!(runner.update_calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.state(), PollState::ProbingInfo);
    }

    #[tokio::test(start_paused = true)]
    async fn period_does_not_drift() {
        let scheduler = Arc::new(scheduler());
        let runner = Arc::new(FakeRunner::new(&[true], &[true]));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = {
            let scheduler = scheduler.clone();
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(runner.as_ref(), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(1_000_500)).await;
        cancel.store(true, Ordering::SeqCst);
        worker.await.unwrap();

        // t = 0, 10, ..., 1000
        assert_eq!(runner.update_calls.load(Ordering::SeqCst), 101);
    }

    /// Update cycles take 25 s against a 10 s interval.
    struct SlowRunner {
        update_calls: AtomicUsize,
    }

    #[async_trait]
    impl CycleRunner for SlowRunner {
        async fn info_cycle(&self) -> bool {
            true
        }

        async fn update_cycle(&self) -> bool {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(25)).await;
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_missed_during_a_slow_cycle_are_dropped() {
        let scheduler = Arc::new(scheduler());
        let runner = Arc::new(SlowRunner {
            update_calls: AtomicUsize::new(0),
        });
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = {
            let scheduler = scheduler.clone();
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(runner.as_ref(), cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.store(true, Ordering::SeqCst);
        worker.await.unwrap();

        // cycles start at t = 0, 30 and 60; the ticks at 10, 20, 40 and 50
        // fell inside a running cycle
        assert_eq!(runner.update_calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.poll_ok.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_continues_on_the_same_cadence() {
        let scheduler = Arc::new(scheduler());
        let runner = Arc::new(FakeRunner::new(&[true], &[true, false, true]));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = {
            let scheduler = scheduler.clone();
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(runner.as_ref(), cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.store(true, Ordering::SeqCst);
        worker.await.unwrap();

        assert_eq!(runner.info_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.update_calls.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.poll_ok.load(Ordering::Relaxed), 4);
        assert_eq!(scheduler.poll_errors.load(Ordering::Relaxed), 1);
    }
}
