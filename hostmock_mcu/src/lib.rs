// hostmock_mcu: fake firmware sketches that run inside the emulated user context

// ---
// These stand in for real firmware while exercising the emulator:
// - Blink drives a virtual LED with timed delays
// - Counter spins through yields and can end the run on its own
// ---

pub mod fake {
    use hostmock_shared::{Cooperative, EmuResult, Sketch};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Observable state of a virtual output pin.
    #[derive(Debug, Default)]
    pub struct VirtualPin {
        level: AtomicBool,
        toggles: AtomicU64,
    }

    impl VirtualPin {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn write(&self, high: bool) {
            if self.level.swap(high, Ordering::AcqRel) != high {
                self.toggles.fetch_add(1, Ordering::AcqRel);
            }
        }

        pub fn is_high(&self) -> bool {
            self.level.load(Ordering::Acquire)
        }

        pub fn toggles(&self) -> u64 {
            self.toggles.load(Ordering::Acquire)
        }
    }

    /// Classic blink: toggle the LED, then sleep half a period.
    pub struct Blink {
        led: Arc<VirtualPin>,
        period_ms: u32,
    }

    impl Blink {
        pub fn new(led: Arc<VirtualPin>, period_ms: u32) -> Self {
            Self { led, period_ms }
        }
    }

    impl Sketch for Blink {
        fn setup(&mut self, _cx: &dyn Cooperative) -> EmuResult<()> {
            self.led.write(false);
            tracing::info!("blink: period {} ms", self.period_ms);
            Ok(())
        }

        fn loop_body(&mut self, cx: &dyn Cooperative) -> EmuResult<()> {
            let next = !self.led.is_high();
            self.led.write(next);
            tracing::debug!("blink: led {} at {} ms", if next { "on" } else { "off" }, cx.millis());
            cx.delay(self.period_ms / 2)
        }

        fn name(&self) -> &str {
            "blink"
        }
    }

    /// Yields `yields_per_pass` times per loop pass and counts passes.
    /// With `limit` set, ends the run once that many passes completed.
    pub struct Counter {
        passes: Arc<AtomicU64>,
        yields_per_pass: u32,
        limit: Option<u64>,
    }

    impl Counter {
        pub fn new(passes: Arc<AtomicU64>, yields_per_pass: u32) -> Self {
            Self {
                passes,
                yields_per_pass,
                limit: None,
            }
        }

        pub fn with_limit(mut self, limit: u64) -> Self {
            self.limit = Some(limit);
            self
        }
    }

    impl Sketch for Counter {
        fn setup(&mut self, _cx: &dyn Cooperative) -> EmuResult<()> {
            self.passes.store(0, Ordering::Release);
            Ok(())
        }

        fn loop_body(&mut self, cx: &dyn Cooperative) -> EmuResult<()> {
            for _ in 0..self.yields_per_pass {
                cx.yield_now()?;
            }
            let done = self.passes.fetch_add(1, Ordering::AcqRel) + 1;
            if self.limit.is_some_and(|limit| done >= limit) {
                tracing::info!("counter: reached {} passes, exiting", done);
                return cx.exit();
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "counter"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn pin_counts_only_level_changes() {
            let pin = VirtualPin::new();
            pin.write(false);
            pin.write(true);
            pin.write(true);
            pin.write(false);
            assert_eq!(pin.toggles(), 2);
            assert!(!pin.is_high());
        }
    }
}
