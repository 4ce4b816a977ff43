// src/scheduler/barrier.rs - Token barrier handing the floor between system and user contexts
use crate::scheduler::timer::DeadlineTimer;
use hostmock_shared::{EmuResult, Stopped, Token};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Everything both contexts touch, guarded by one mutex.
#[derive(Debug)]
struct BarrierState {
    token: Token,
    /// Coalesced "give the user context a turn" request.
    schedule_requested: bool,
    timer: DeadlineTimer,
    /// Set by the user context after its first full setup + loop pass.
    pass_complete: bool,
}

/// Mutex-protected token plus condition variable. One per emulated run.
#[derive(Debug)]
pub struct Barrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Barrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                token: Token::Default,
                schedule_requested: false,
                timer: DeadlineTimer::new(),
                pass_complete: false,
            }),
            cond: Condvar::new(),
        }
    }

    // A panic on the other side must not wedge this one; the state is plain
    // data and stays consistent across an unwind.
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token(&self) -> Token {
        self.lock().token
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().token.is_stop()
    }

    /// Set the schedule request flag. Idempotent until the next granted turn.
    pub fn request_schedule(&self) {
        let mut state = self.lock();
        if !state.schedule_requested {
            tracing::trace!("schedule requested");
        }
        state.schedule_requested = true;
    }

    pub fn schedule_pending(&self) -> bool {
        self.lock().schedule_requested
    }

    /// Clear the schedule flag, returning whether it was set.
    pub fn take_schedule(&self) -> bool {
        std::mem::take(&mut self.lock().schedule_requested)
    }

    /// Move to `Stop` permanently and wake every waiter.
    ///
    /// Returns `true` for the call that performed the transition.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        if state.token.is_stop() {
            return false;
        }
        tracing::debug!("token {} -> stop", state.token);
        state.token = Token::Stop;
        state.timer.disarm();
        drop(state);
        self.cond.notify_all();
        true
    }

    /// Publish a new token. Fails without changing anything once stopped.
    pub fn hand_off(&self, to: Token) -> EmuResult<()> {
        let mut state = self.lock();
        Self::transition(&mut state, to)?;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn transition(state: &mut BarrierState, to: Token) -> EmuResult<()> {
        if state.token.is_stop() {
            return Err(Stopped);
        }
        if to.is_stop() {
            state.timer.disarm();
        }
        tracing::trace!("token {} -> {}", state.token, to);
        state.token = to;
        Ok(())
    }

    fn wait_while_not<'a>(
        &'a self,
        mut state: MutexGuard<'a, BarrierState>,
        want: Token,
    ) -> EmuResult<()> {
        while state.token != want && !state.token.is_stop() {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.token.is_stop() { Err(Stopped) } else { Ok(()) }
    }

    /// Block until `want` is current or the run stops.
    pub fn wait_for(&self, want: Token) -> EmuResult<()> {
        let state = self.lock();
        self.wait_while_not(state, want)
    }

    /// Like [`Barrier::wait_for`], bounded. `Ok(false)` means the wait timed out.
    pub fn wait_for_timeout(&self, want: Token, timeout: Duration) -> EmuResult<bool> {
        let state = self.lock();
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.token != want && !s.token.is_stop())
            .unwrap_or_else(PoisonError::into_inner);
        if state.token.is_stop() {
            return Err(Stopped);
        }
        Ok(state.token == want)
    }

    /// System side: if a turn was requested, clear the request, give the
    /// floor to the user context and block until it is handed back.
    ///
    /// `Ok(false)` means no turn was pending and nothing happened.
    pub fn grant_user_turn(&self) -> EmuResult<bool> {
        let mut state = self.lock();
        if state.token.is_stop() {
            return Err(Stopped);
        }
        if !state.schedule_requested {
            return Ok(false);
        }
        state.schedule_requested = false;
        Self::transition(&mut state, Token::User)?;
        self.cond.notify_all();
        self.wait_while_not(state, Token::Sys)?;
        Ok(true)
    }

    /// User side: hand the floor back and block until it is granted again.
    pub fn suspend_user(&self) -> EmuResult<()> {
        let mut state = self.lock();
        Self::transition(&mut state, Token::Sys)?;
        self.cond.notify_all();
        self.wait_while_not(state, Token::User)
    }

    /// Arm the delay timer; the returned guard disarms it when dropped.
    pub fn arm_timer(&self, after: Duration) -> TimerGuard<'_> {
        let armed = self.lock().timer.arm(Instant::now(), after);
        if armed {
            tracing::trace!("deadline timer armed for {:?}", after);
        } else {
            tracing::warn!("deadline timer already pending, not re-armed");
        }
        TimerGuard { barrier: self, owned: armed }
    }

    /// Turn an expired deadline into a schedule request.
    pub fn fire_due_timer(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if state.timer.fire_if_due(now) {
            tracing::trace!("deadline timer fired");
            state.schedule_requested = true;
            true
        } else {
            false
        }
    }

    pub fn timer_armed(&self) -> bool {
        self.lock().timer.is_armed()
    }

    pub fn mark_pass_complete(&self) {
        self.lock().pass_complete = true;
    }

    pub fn pass_complete(&self) -> bool {
        self.lock().pass_complete
    }
}

/// Disarms the delay timer when the enclosing delay ends, however it ends.
#[must_use]
#[derive(Debug)]
pub struct TimerGuard<'a> {
    barrier: &'a Barrier,
    owned: bool,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        if self.owned && self.barrier.lock().timer.disarm() {
            tracing::trace!("deadline timer disarmed before firing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn schedule_requests_coalesce() {
        let barrier = Barrier::new();
        barrier.request_schedule();
        barrier.request_schedule();
        barrier.request_schedule();
        assert!(barrier.take_schedule());
        assert!(!barrier.take_schedule());
    }

    #[test]
    fn stop_is_permanent() {
        let barrier = Barrier::new();
        assert!(barrier.stop());
        assert!(!barrier.stop());
        assert_eq!(barrier.hand_off(Token::User), Err(Stopped));
        assert_eq!(barrier.token(), Token::Stop);
        assert_eq!(barrier.wait_for(Token::User), Err(Stopped));
    }

    #[test]
    fn grant_without_request_is_a_noop() {
        let barrier = Barrier::new();
        assert_eq!(barrier.grant_user_turn(), Ok(false));
        assert_eq!(barrier.token(), Token::Default);
    }

    #[test]
    fn grant_waits_for_the_floor_to_come_back() {
        let barrier = Arc::new(Barrier::new());
        let user = {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait_for(Token::User).unwrap();
                barrier.suspend_user()
            })
        };
        barrier.request_schedule();
        assert_eq!(barrier.grant_user_turn(), Ok(true));
        assert_eq!(barrier.token(), Token::Sys);
        assert!(!barrier.schedule_pending());
        barrier.stop();
        assert_eq!(user.join().unwrap(), Err(Stopped));
    }

    #[test]
    fn late_waiter_still_sees_stop() {
        let barrier = Arc::new(Barrier::new());
        barrier.stop();
        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait_for(Token::User))
        };
        assert_eq!(waiter.join().unwrap(), Err(Stopped));
    }

    #[test]
    fn bounded_wait_times_out() {
        let barrier = Barrier::new();
        assert_eq!(
            barrier.wait_for_timeout(Token::User, Duration::from_millis(5)),
            Ok(false)
        );
    }

    #[test]
    fn timer_guard_disarms_on_drop() {
        let barrier = Barrier::new();
        {
            let _guard = barrier.arm_timer(Duration::from_secs(60));
            assert!(barrier.timer_armed());
        }
        assert!(!barrier.timer_armed());
        assert!(!barrier.fire_due_timer(Instant::now() + Duration::from_secs(120)));
        assert!(!barrier.schedule_pending());
    }

    #[test]
    fn fired_timer_requests_a_turn() {
        let barrier = Barrier::new();
        let _guard = barrier.arm_timer(Duration::ZERO);
        assert!(barrier.fire_due_timer(Instant::now()));
        assert!(barrier.schedule_pending());
    }
}
