// hostmock_shared: shared traits and types for the emulator, the transports and fake firmware

use std::fmt;
use thiserror::Error;

// --- Execution token ---

/// Which side of the emulated single core currently has the floor.
///
/// Exactly one value is current at any time. `Stop` is terminal: once set it
/// is never replaced, so a waiter that arrives late still observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// Initial value, nobody has been granted the floor yet.
    Default,
    /// The run is over.
    Stop,
    /// The user context (firmware setup/loop) is running.
    User,
    /// The system context is doing housekeeping or waiting for a schedule request.
    Sys,
}

impl Token {
    pub fn is_stop(self) -> bool {
        matches!(self, Token::Stop)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Token::Default => "default",
            Token::Stop => "stop",
            Token::User => "user",
            Token::Sys => "sys",
        };
        f.write_str(name)
    }
}

// --- Cooperative cancellation ---

/// Raised at a suspend point once the run has been stopped.
///
/// Firmware propagates it with `?`; every frame between the suspend point and
/// the user thread's entry unwinds normally, so guards and buffers it owns are
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("emulated run stopped")]
pub struct Stopped;

pub type EmuResult<T> = Result<T, Stopped>;

// --- Firmware-facing traits ---

/// Operations available to firmware running inside the user context.
pub trait Cooperative {
    /// Ask for another turn at the next opportunity. Never blocks; repeated
    /// requests before the turn is granted collapse into one.
    fn schedule(&self);

    /// Hand the floor to the system context and block until it is handed back.
    fn suspend(&self) -> EmuResult<()>;

    /// `schedule` followed by `suspend`.
    fn yield_now(&self) -> EmuResult<()> {
        self.schedule();
        self.suspend()
    }

    /// Sleep for `ms` milliseconds of host time without holding the floor.
    fn delay(&self, ms: u32) -> EmuResult<()>;

    /// Milliseconds since the emulated run started.
    fn millis(&self) -> u64;

    /// End the whole run. Always returns `Err(Stopped)` so the caller unwinds.
    fn exit(&self) -> EmuResult<()>;
}

/// Firmware under test: `setup` runs exactly once, then `loop_body` repeatedly.
pub trait Sketch: Send {
    fn setup(&mut self, cx: &dyn Cooperative) -> EmuResult<()>;
    fn loop_body(&mut self, cx: &dyn Cooperative) -> EmuResult<()>;

    fn name(&self) -> &str {
        "sketch"
    }
}

impl<S: Sketch + ?Sized> Sketch for Box<S> {
    fn setup(&mut self, cx: &dyn Cooperative) -> EmuResult<()> {
        (**self).setup(cx)
    }

    fn loop_body(&mut self, cx: &dyn Cooperative) -> EmuResult<()> {
        (**self).loop_body(cx)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Adapter turning a pair of closures into a [`Sketch`].
pub struct FnSketch<S, L> {
    setup: S,
    body: L,
}

impl<S, L> FnSketch<S, L>
where
    S: FnMut(&dyn Cooperative) -> EmuResult<()> + Send,
    L: FnMut(&dyn Cooperative) -> EmuResult<()> + Send,
{
    pub fn new(setup: S, body: L) -> Self {
        Self { setup, body }
    }
}

impl<S, L> Sketch for FnSketch<S, L>
where
    S: FnMut(&dyn Cooperative) -> EmuResult<()> + Send,
    L: FnMut(&dyn Cooperative) -> EmuResult<()> + Send,
{
    fn setup(&mut self, cx: &dyn Cooperative) -> EmuResult<()> {
        (self.setup)(cx)
    }

    fn loop_body(&mut self, cx: &dyn Cooperative) -> EmuResult<()> {
        (self.body)(cx)
    }

    fn name(&self) -> &str {
        "fn-sketch"
    }
}

/// Shorthand for [`FnSketch::new`].
pub fn sketch_fn<S, L>(setup: S, body: L) -> FnSketch<S, L>
where
    S: FnMut(&dyn Cooperative) -> EmuResult<()> + Send,
    L: FnMut(&dyn Cooperative) -> EmuResult<()> + Send,
{
    FnSketch::new(setup, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct NoopCx {
        scheduled: Cell<u32>,
    }

    impl Cooperative for NoopCx {
        fn schedule(&self) {
            self.scheduled.set(self.scheduled.get() + 1);
        }
        fn suspend(&self) -> EmuResult<()> {
            Err(Stopped)
        }
        fn delay(&self, _ms: u32) -> EmuResult<()> {
            Ok(())
        }
        fn millis(&self) -> u64 {
            0
        }
        fn exit(&self) -> EmuResult<()> {
            Err(Stopped)
        }
    }

    #[test]
    fn yield_now_schedules_before_suspending() {
        let cx = NoopCx { scheduled: Cell::new(0) };
        assert_eq!(cx.yield_now(), Err(Stopped));
        assert_eq!(cx.scheduled.get(), 1);
    }

    #[test]
    fn fn_sketch_forwards_both_callbacks() {
        let cx = NoopCx { scheduled: Cell::new(0) };
        let mut setups = 0;
        let mut loops = 0;
        {
            let mut sketch = sketch_fn(
                |_| {
                    setups += 1;
                    Ok(())
                },
                |_| {
                    loops += 1;
                    Ok(())
                },
            );
            sketch.setup(&cx).unwrap();
            sketch.loop_body(&cx).unwrap();
            sketch.loop_body(&cx).unwrap();
        }
        assert_eq!(setups, 1);
        assert_eq!(loops, 2);
    }

    #[test]
    fn only_stop_is_terminal() {
        assert!(Token::Stop.is_stop());
        assert!(!Token::Sys.is_stop());
        assert_eq!(Token::User.to_string(), "user");
    }
}
