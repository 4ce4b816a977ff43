// src/scheduler/user.rs - The user context: firmware setup/loop on its own OS thread
use crate::scheduler::barrier::Barrier;
use crate::scheduler::RunCounters;
use hostmock_shared::{Cooperative, EmuResult, Sketch, Stopped, Token};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Handle firmware code uses to cooperate with the system context.
#[derive(Debug, Clone)]
pub struct UserContext {
    barrier: Arc<Barrier>,
    started: Instant,
}

impl UserContext {
    pub(crate) fn new(barrier: Arc<Barrier>, started: Instant) -> Self {
        Self { barrier, started }
    }

    pub fn token(&self) -> Token {
        self.barrier.token()
    }
}

impl Cooperative for UserContext {
    fn schedule(&self) {
        self.barrier.request_schedule();
    }

    fn suspend(&self) -> EmuResult<()> {
        self.barrier.suspend_user()
    }

    fn delay(&self, ms: u32) -> EmuResult<()> {
        if ms == 0 {
            return self.yield_now();
        }
        // Dropped on every exit path, including the unwind after a stop.
        let _timer = self.barrier.arm_timer(Duration::from_millis(u64::from(ms)));
        self.suspend()
    }

    fn millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn exit(&self) -> EmuResult<()> {
        if self.barrier.stop() {
            tracing::info!("user context requested stop");
        }
        Err(Stopped)
    }
}

/// Forces `Stop` when the user thread ends, even by panic, so the system
/// context never waits on a floor that will not come back.
struct StopOnExit(Arc<Barrier>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        if self.0.stop() && std::thread::panicking() {
            tracing::error!("user context panicked, stopping run");
        }
    }
}

/// Body of the user thread.
pub(crate) fn run_user_context<S: Sketch>(
    mut sketch: S,
    cx: UserContext,
    counters: Arc<RunCounters>,
    run_once: bool,
) {
    let _stop_guard = StopOnExit(cx.barrier.clone());
    let result = drive_sketch(&mut sketch, &cx, &counters, run_once);
    match result {
        Err(Stopped) => tracing::debug!("{}: user context unwound after stop", sketch.name()),
        Ok(()) => tracing::debug!("{}: user context finished", sketch.name()),
    }
}

fn drive_sketch<S: Sketch>(
    sketch: &mut S,
    cx: &UserContext,
    counters: &RunCounters,
    run_once: bool,
) -> EmuResult<()> {
    cx.barrier.wait_for(Token::User)?;
    tracing::debug!("{}: setup", sketch.name());
    counters.setup_calls.fetch_add(1, Ordering::AcqRel);
    sketch.setup(cx)?;
    loop {
        counters.loop_calls.fetch_add(1, Ordering::AcqRel);
        sketch.loop_body(cx)?;
        if run_once {
            cx.barrier.mark_pass_complete();
            // Hand the floor back without asking for another turn; the
            // system context stops the run from here.
            loop {
                cx.suspend()?;
            }
        }
        // End of a loop pass: re-post the loop and give the system a tick.
        cx.yield_now()?;
    }
}
