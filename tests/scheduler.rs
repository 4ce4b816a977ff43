use hostmock_mcu::fake::{Blink, Counter, VirtualPin};
use hostmock_rs::{
    Cooperative, Emulator, EmulatorError, RunMode, RunOptions, StopCause, Stopped, run_loop,
    sketch_fn,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Tracks how many contexts are inside a critical section at once.
#[derive(Default)]
struct Occupancy {
    active: AtomicUsize,
    max: AtomicUsize,
}

impl Occupancy {
    fn visit(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_micros(200));
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sets its flag when dropped.
struct Cleanup(Arc<AtomicBool>);

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_run_once_runs_setup_and_loop_exactly_once() {
    let setups = Arc::new(AtomicU64::new(0));
    let loops = Arc::new(AtomicU64::new(0));
    let (s, l) = (setups.clone(), loops.clone());
    let sketch = sketch_fn(
        move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        move |_| {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );
    let exit = AtomicBool::new(false);
    let stats = run_loop(sketch, || {}, 0, true, &exit).unwrap();
    assert_eq!(setups.load(Ordering::SeqCst), 1);
    assert_eq!(loops.load(Ordering::SeqCst), 1);
    assert_eq!(stats.mode, RunMode::RunOnce);
    assert_eq!(stats.cause, StopCause::RunOnceComplete);
    assert_eq!(stats.setup_calls, 1);
    assert_eq!(stats.loop_calls, 1);
}

#[test]
fn test_run_once_survives_yields_inside_the_pass() {
    let loops = Arc::new(AtomicU64::new(0));
    let l = loops.clone();
    let sketch = sketch_fn(
        |cx| cx.yield_now(),
        move |cx| {
            for _ in 0..5 {
                cx.yield_now()?;
            }
            cx.delay(2)?;
            l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    );
    let exit = AtomicBool::new(false);
    let stats = Emulator::new(RunOptions::run_once())
        .run_loop(sketch, || {}, &exit)
        .unwrap();
    assert_eq!(loops.load(Ordering::SeqCst), 1);
    assert_eq!(stats.loop_calls, 1);
    assert!(stats.user_turns >= 7, "every yield costs a turn: {:?}", stats);
}

#[test]
fn test_contexts_never_run_at_the_same_time() {
    let occupancy = Arc::new(Occupancy::default());
    let sys = occupancy.clone();
    let user = occupancy.clone();
    let passes = Arc::new(AtomicU64::new(0));
    let p = passes.clone();
    let sketch = sketch_fn(
        |_| Ok(()),
        move |cx| {
            user.visit();
            cx.yield_now()?;
            user.visit();
            if p.fetch_add(1, Ordering::SeqCst) + 1 >= 50 {
                return cx.exit();
            }
            Ok(())
        },
    );
    let exit = AtomicBool::new(false);
    let stats = Emulator::new(RunOptions::continuous(Duration::ZERO))
        .run_loop(sketch, move || sys.visit(), &exit)
        .unwrap();
    assert_eq!(stats.cause, StopCause::Requested);
    assert_eq!(passes.load(Ordering::SeqCst), 50);
    assert_eq!(occupancy.max.load(Ordering::SeqCst), 1);
}

#[test]
fn test_exit_flag_unblocks_a_delayed_user_context() {
    let cleaned = Arc::new(AtomicBool::new(false));
    let stopped_seen = Arc::new(AtomicBool::new(false));
    let (c, seen) = (cleaned.clone(), stopped_seen.clone());
    let sketch = sketch_fn(
        |_| Ok(()),
        move |cx| {
            let _cleanup = Cleanup(c.clone());
            let result = cx.delay(60_000);
            if result == Err(Stopped) {
                seen.store(true, Ordering::SeqCst);
            }
            result
        },
    );
    let exit = Arc::new(AtomicBool::new(false));
    let raiser = {
        let exit = exit.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            exit.store(true, Ordering::SeqCst);
        })
    };
    let started = Instant::now();
    let stats = Emulator::new(RunOptions::continuous(Duration::from_millis(1)))
        .run_loop(sketch, || {}, &exit)
        .unwrap();
    raiser.join().unwrap();
    assert_eq!(stats.cause, StopCause::ExitFlag);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(stopped_seen.load(Ordering::SeqCst));
    assert!(cleaned.load(Ordering::SeqCst));
}

#[test]
fn test_scheduler_handle_stops_the_run() {
    let emulator = Emulator::new(RunOptions::continuous(Duration::from_millis(1)));
    let scheduler = emulator.scheduler();
    let passes = Arc::new(AtomicU64::new(0));
    let stopper = {
        let scheduler = scheduler.clone();
        let passes = passes.clone();
        thread::spawn(move || {
            while passes.load(Ordering::SeqCst) < 3 {
                thread::sleep(Duration::from_millis(1));
            }
            assert!(scheduler.stop());
            assert!(!scheduler.stop());
        })
    };
    let exit = AtomicBool::new(false);
    let stats = emulator
        .run_loop(Counter::new(passes.clone(), 2), || {}, &exit)
        .unwrap();
    stopper.join().unwrap();
    assert_eq!(stats.cause, StopCause::Requested);
    assert!(scheduler.is_stopped());
    assert!(scheduler.token().is_stop());
}

#[test]
fn test_counter_with_limit_ends_the_run_itself() {
    let passes = Arc::new(AtomicU64::new(0));
    let exit = AtomicBool::new(false);
    let stats = run_loop(Counter::new(passes.clone(), 3).with_limit(10), || {}, 0, false, &exit)
        .unwrap();
    assert_eq!(stats.cause, StopCause::Requested);
    assert_eq!(passes.load(Ordering::SeqCst), 10);
    assert_eq!(stats.loop_calls, 10);
    assert_eq!(stats.setup_calls, 1);
}

#[test]
fn test_delay_waits_at_least_the_requested_time() {
    let measured = Arc::new(AtomicU64::new(0));
    let m = measured.clone();
    let sketch = sketch_fn(
        move |cx: &dyn Cooperative| {
            let started = Instant::now();
            cx.delay(30)?;
            m.store(started.elapsed().as_millis() as u64, Ordering::SeqCst);
            cx.exit()
        },
        |_| Ok(()),
    );
    let exit = AtomicBool::new(false);
    let stats = run_loop(sketch, || {}, 1, false, &exit).unwrap();
    assert_eq!(stats.cause, StopCause::Requested);
    assert_eq!(stats.loop_calls, 0);
    assert!(measured.load(Ordering::SeqCst) >= 30);
}

#[test]
fn test_millis_is_monotonic_from_run_start() {
    let readings = Arc::new(std::sync::Mutex::new(Vec::new()));
    let r = readings.clone();
    let sketch = sketch_fn(
        |_| Ok(()),
        move |cx| {
            let mut readings = r.lock().unwrap();
            readings.push(cx.millis());
            if readings.len() == 5 {
                drop(readings);
                return cx.exit();
            }
            drop(readings);
            cx.delay(3)
        },
    );
    let exit = AtomicBool::new(false);
    run_loop(sketch, || {}, 1, false, &exit).unwrap();
    let readings = readings.lock().unwrap();
    assert_eq!(readings.len(), 5);
    assert!(readings.windows(2).all(|w| w[0] <= w[1]));
    assert!(readings[4] >= readings[0] + 12);
}

#[test]
fn test_blink_toggles_the_led() {
    let led = VirtualPin::new();
    let exit = Arc::new(AtomicBool::new(false));
    let raiser = {
        let exit = exit.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(80));
            exit.store(true, Ordering::SeqCst);
        })
    };
    let stats = run_loop(Blink::new(led.clone(), 10), || {}, 1, false, &exit).unwrap();
    raiser.join().unwrap();
    assert_eq!(stats.cause, StopCause::ExitFlag);
    assert!(led.toggles() >= 2, "toggles: {}", led.toggles());
}

#[test]
fn test_user_panic_is_reported() {
    let sketch = sketch_fn(|_| Ok(()), |_| -> Result<(), Stopped> { panic!("sketch blew up") });
    let exit = AtomicBool::new(false);
    let err = run_loop(sketch, || {}, 0, false, &exit).unwrap_err();
    match err {
        EmulatorError::UserPanicked(msg) => assert!(msg.contains("sketch blew up")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_system_tick_runs_every_iteration() {
    let ticks = Arc::new(AtomicU64::new(0));
    let t = ticks.clone();
    let exit = AtomicBool::new(false);
    let stats = run_loop(
        Counter::new(Arc::new(AtomicU64::new(0)), 1).with_limit(5),
        move || {
            t.fetch_add(1, Ordering::SeqCst);
        },
        0,
        false,
        &exit,
    )
    .unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), stats.ticks);
    assert!(stats.ticks >= stats.user_turns);
}
