//! Background space reclamation.
//!
//! Deleting rows does not give storage back to the engine, so a dedicated
//! thread periodically runs `OPTIMIZE TABLE` over the content and inode
//! tables. How eagerly it does that is the reclaimer level: `off` never
//! runs, `optimistic` waits for a quiet spell after the last mutation, and
//! `aggressive` runs after every delete. The thread has its own database
//! connection and never fails the file system; errors are logged and
//! retried.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::error;
use log::info;
use parking_lot::Mutex;

use crate::db::DbClient;
use crate::db::DbError;
use crate::db::DbParams;

/// How long the optimistic level waits with no notifications before
/// running.
const QUIESCENCE_WINDOW: Duration = Duration::from_secs(60 * 30);

/// How long to wait before retrying a failed optimize.
const QUERY_RETRY_TIME: Duration = Duration::from_secs(30);

/// Idle poll interval; also bounds how long a shutdown can take.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// How aggressively space is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimerLevel {
    Off,
    Optimistic,
    Aggressive,
}

impl ReclaimerLevel {
    pub fn parse(value: &str) -> Option<ReclaimerLevel> {
        match value {
            "off" => Some(ReclaimerLevel::Off),
            "optimistic" => Some(ReclaimerLevel::Optimistic),
            "aggressive" => Some(ReclaimerLevel::Aggressive),
            _ => None,
        }
    }
}

/// What kind of mutation a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimerAction {
    General,
    Delete,
}

struct Shared {
    level: ReclaimerLevel,
    running: AtomicBool,
    /// When the optimistic level last heard about a mutation.
    last_action: Mutex<Option<Instant>>,
    /// Set by delete notifications when running aggressively.
    delete_pending: AtomicBool,
}

impl Shared {
    fn should_run(&self, now: Instant) -> bool {
        match self.level {
            ReclaimerLevel::Off => false,
            ReclaimerLevel::Optimistic => self
                .last_action
                .lock()
                .is_some_and(|last| now.duration_since(last) >= QUIESCENCE_WINDOW),
            ReclaimerLevel::Aggressive => self.delete_pending.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        match self.level {
            ReclaimerLevel::Off => {}
            ReclaimerLevel::Optimistic => *self.last_action.lock() = None,
            ReclaimerLevel::Aggressive => self.delete_pending.store(false, Ordering::Relaxed),
        }
    }

    fn notify(&self, action: ReclaimerAction) {
        match self.level {
            ReclaimerLevel::Off => {}
            ReclaimerLevel::Optimistic => *self.last_action.lock() = Some(Instant::now()),
            ReclaimerLevel::Aggressive => {
                if action == ReclaimerAction::Delete {
                    self.delete_pending.store(true, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Handle used by the file system to report mutations.
#[derive(Clone)]
pub struct ReclaimerNotifier {
    shared: Arc<Shared>,
}

impl ReclaimerNotifier {
    pub fn notify(&self, action: ReclaimerAction) {
        self.shared.notify(action);
    }
}

pub struct Reclaimer {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Reclaimer {
    /// Starts the reclaimer at `level` with its own database connection.
    /// At `off` no thread or connection is created and notifications are
    /// no-ops.
    pub fn start(level: ReclaimerLevel, params: &DbParams) -> Result<Reclaimer, DbError> {
        let shared = Arc::new(Shared {
            level,
            running: AtomicBool::new(false),
            last_action: Mutex::new(None),
            delete_pending: AtomicBool::new(false),
        });

        if level == ReclaimerLevel::Off {
            info!("reclaimer is off");
            return Ok(Reclaimer { shared, thread: None });
        }

        info!("reclaimer starting");
        let db = DbClient::connect(params)?;
        shared.running.store(true, Ordering::Relaxed);
        let worker = Arc::clone(&shared);
        let thread = thread::spawn(move || run_loop(worker, db));
        Ok(Reclaimer {
            shared,
            thread: Some(thread),
        })
    }

    pub fn notifier(&self) -> ReclaimerNotifier {
        ReclaimerNotifier {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Cooperative shutdown: clears the running flag, which the loop
    /// notices within one idle tick, then joins the thread.
    pub fn stop(&mut self) {
        if self.shared.running.swap(false, Ordering::Relaxed) {
            info!("reclaimer stopping");
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: Arc<Shared>, mut db: DbClient) {
    let mut next_try: Option<Instant> = None;
    while shared.running.load(Ordering::Relaxed) {
        if !shared.should_run(Instant::now()) {
            thread::sleep(IDLE_TICK);
            continue;
        }

        // A previous optimize failed; wait out the retry window in ticks
        // so shutdown stays responsive.
        if let Some(at) = next_try {
            if Instant::now() < at {
                thread::sleep(IDLE_TICK);
                continue;
            }
            next_try = None;
        }

        // OPTIMIZE TABLE returns a result set which must be fetched, or
        // the next statement on this connection fails.
        match db.query_rows("OPTIMIZE TABLE `file_data`,`files`") {
            Ok(_) => shared.reset(),
            Err(err) => {
                error!(
                    "error reclaiming space, trying again in {} seconds: {err}",
                    QUERY_RETRY_TIME.as_secs()
                );
                next_try = Some(Instant::now() + QUERY_RETRY_TIME);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(level: ReclaimerLevel) -> Shared {
        Shared {
            level,
            running: AtomicBool::new(false),
            last_action: Mutex::new(None),
            delete_pending: AtomicBool::new(false),
        }
    }

    #[test]
    fn level_parsing() {
        assert_eq!(ReclaimerLevel::parse("off"), Some(ReclaimerLevel::Off));
        assert_eq!(
            ReclaimerLevel::parse("optimistic"),
            Some(ReclaimerLevel::Optimistic)
        );
        assert_eq!(
            ReclaimerLevel::parse("aggressive"),
            Some(ReclaimerLevel::Aggressive)
        );
        assert_eq!(ReclaimerLevel::parse("eager"), None);
    }

    #[test]
    fn off_never_runs() {
        let state = shared(ReclaimerLevel::Off);
        state.notify(ReclaimerAction::Delete);
        assert!(!state.should_run(Instant::now()));
    }

    #[test]
    fn optimistic_waits_for_quiescence() {
        let state = shared(ReclaimerLevel::Optimistic);
        let now = Instant::now();

        // Never notified: nothing to reclaim.
        assert!(!state.should_run(now));

        state.notify(ReclaimerAction::General);
        assert!(!state.should_run(Instant::now()));

        // Pretend the notification happened past the quiescence window.
        *state.last_action.lock() = now.checked_sub(QUIESCENCE_WINDOW);
        if state.last_action.lock().is_some() {
            assert!(state.should_run(now));
        }

        state.reset();
        assert!(!state.should_run(Instant::now()));
    }

    #[test]
    fn optimistic_resets_its_timer_on_any_action() {
        let state = shared(ReclaimerLevel::Optimistic);
        *state.last_action.lock() = Instant::now().checked_sub(QUIESCENCE_WINDOW);
        state.notify(ReclaimerAction::Delete);
        // Fresh notification pushes the quiet window out again.
        assert!(!state.should_run(Instant::now()));
    }

    #[test]
    fn aggressive_runs_only_after_deletes() {
        let state = shared(ReclaimerLevel::Aggressive);
        state.notify(ReclaimerAction::General);
        assert!(!state.should_run(Instant::now()));

        state.notify(ReclaimerAction::Delete);
        assert!(state.should_run(Instant::now()));

        state.reset();
        assert!(!state.should_run(Instant::now()));
    }
}
