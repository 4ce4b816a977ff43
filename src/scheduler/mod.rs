// src/scheduler/mod.rs - Two-context cooperative scheduling emulator
//!
//! The emulated device has one core. Two real OS threads stand in for its two
//! execution contexts:
//!
//! - the *system* context is the caller of [`Emulator::run_loop`]; it runs the
//!   housekeeping tick and decides when the user context may run,
//! - the *user* context is spawned once and runs the sketch's `setup` followed
//!   by its `loop_body` forever.
//!
//! A [`Barrier`] token decides which of the two has the floor. The user context
//! only gives it up at `suspend`, `yield_now` and `delay`; once the run is
//! stopped those calls return [`Stopped`] and the firmware unwinds with `?`.
//!
//! ```ignore
//! let exit = AtomicBool::new(false);
//! let stats = Emulator::new(RunOptions::run_once()).run_loop(sketch, || {}, &exit)?;
//! assert_eq!(stats.loop_calls, 1);
//! ```

pub mod barrier;
pub mod timer;
pub mod user;

pub use barrier::{Barrier, TimerGuard};
pub use timer::DeadlineTimer;
pub use user::UserContext;

use crate::config::SchedulerConfig;
use hostmock_shared::{Sketch, Stopped, Token};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("failed to spawn user context thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("user context panicked: {0}")]
    UserPanicked(String),
}

/// How long the driving loop keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    /// Until the external exit flag is raised or someone stops the run.
    Continuous,
    /// Exactly one setup + loop pass, then stop.
    RunOnce,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub tick_interval: Duration,
    pub mode: RunMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1),
            mode: RunMode::Continuous,
        }
    }
}

impl RunOptions {
    pub fn continuous(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            mode: RunMode::Continuous,
        }
    }

    pub fn run_once() -> Self {
        Self {
            tick_interval: Duration::ZERO,
            mode: RunMode::RunOnce,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(u64::from(config.tick_interval_ms)),
            mode: if config.run_once {
                RunMode::RunOnce
            } else {
                RunMode::Continuous
            },
        }
    }
}

/// Why the driving loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopCause {
    ExitFlag,
    RunOnceComplete,
    /// `stop()` was called on a [`Scheduler`] handle or the firmware called `exit()`.
    Requested,
}

/// Counters the user thread updates while the run is live.
#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub(crate) setup_calls: AtomicU64,
    pub(crate) loop_calls: AtomicU64,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub mode: RunMode,
    pub ticks: u64,
    pub user_turns: u64,
    pub setup_calls: u64,
    pub loop_calls: u64,
    pub elapsed_ms: u64,
    pub cause: StopCause,
}

/// System-side handle on a run's barrier.
#[derive(Debug, Clone)]
pub struct Scheduler {
    barrier: Arc<Barrier>,
}

impl Scheduler {
    /// Ask for a user-context turn on the next tick.
    pub fn schedule(&self) {
        self.barrier.request_schedule();
    }

    /// Stop the run; every current and future suspend returns `Stopped`.
    pub fn stop(&self) -> bool {
        let first = self.barrier.stop();
        if first {
            tracing::info!("run stop requested");
        }
        first
    }

    pub fn token(&self) -> Token {
        self.barrier.token()
    }

    pub fn is_stopped(&self) -> bool {
        self.barrier.is_stopped()
    }
}

/// One emulated run.
pub struct Emulator {
    barrier: Arc<Barrier>,
    options: RunOptions,
}

impl Emulator {
    pub fn new(options: RunOptions) -> Self {
        Self {
            barrier: Arc::new(Barrier::new()),
            options,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(RunOptions::from_config(config))
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            barrier: self.barrier.clone(),
        }
    }

    /// Drive the run from the calling thread until it ends.
    ///
    /// Each tick calls `system_tick`, sleeps the tick interval, fires an
    /// expired delay timer and, if a turn was requested, hands the floor to
    /// the user context and waits for it to come back.
    pub fn run_loop<S, T>(
        self,
        sketch: S,
        mut system_tick: T,
        exit: &AtomicBool,
    ) -> Result<RunStats, EmulatorError>
    where
        S: Sketch + 'static,
        T: FnMut(),
    {
        let started = Instant::now();
        let run_once = self.options.mode == RunMode::RunOnce;
        let counters = Arc::new(RunCounters::default());
        let name = sketch.name().to_string();

        tracing::info!(
            "starting {} ({:?}, tick {:?})",
            name,
            self.options.mode,
            self.options.tick_interval
        );

        // The loop task is posted once at boot.
        self.barrier.request_schedule();

        let user = {
            let cx = UserContext::new(self.barrier.clone(), started);
            let counters = counters.clone();
            thread::Builder::new()
                .name("user-context".to_string())
                .spawn(move || user::run_user_context(sketch, cx, counters, run_once))
                .map_err(|e| {
                    self.barrier.stop();
                    EmulatorError::Spawn(e)
                })?
        };

        let mut ticks = 0u64;
        let mut user_turns = 0u64;
        let cause = loop {
            if exit.load(Ordering::Acquire) {
                break StopCause::ExitFlag;
            }
            system_tick();
            ticks += 1;
            if self.options.tick_interval.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(self.options.tick_interval);
            }
            self.barrier.fire_due_timer(Instant::now());
            match self.barrier.grant_user_turn() {
                Ok(true) => {
                    user_turns += 1;
                    if run_once && self.barrier.pass_complete() {
                        break StopCause::RunOnceComplete;
                    }
                }
                Ok(false) => {}
                Err(Stopped) => break StopCause::Requested,
            }
        };

        self.barrier.stop();
        if let Err(payload) = user.join() {
            let msg = panic_message(payload.as_ref());
            tracing::error!("{}: user context panicked: {}", name, msg);
            return Err(EmulatorError::UserPanicked(msg));
        }

        let stats = RunStats {
            mode: self.options.mode,
            ticks,
            user_turns,
            setup_calls: counters.setup_calls.load(Ordering::Acquire),
            loop_calls: counters.loop_calls.load(Ordering::Acquire),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            cause,
        };
        tracing::info!(
            "{} stopped ({:?}) after {} ticks, {} user turns",
            name,
            stats.cause,
            stats.ticks,
            stats.user_turns
        );
        Ok(stats)
    }
}

/// Convenience wrapper matching the classic host-emulation entry point.
pub fn run_loop<S, T>(
    sketch: S,
    system_tick: T,
    tick_interval_ms: u32,
    run_once: bool,
    exit: &AtomicBool,
) -> Result<RunStats, EmulatorError>
where
    S: Sketch + 'static,
    T: FnMut(),
{
    let options = RunOptions {
        tick_interval: Duration::from_millis(u64::from(tick_interval_ms)),
        mode: if run_once {
            RunMode::RunOnce
        } else {
            RunMode::Continuous
        },
    };
    Emulator::new(options).run_loop(sketch, system_tick, exit)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
