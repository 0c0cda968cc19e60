use crate::ll_interface::SimTime;
use crate::ll_scheduler::{EventHandle, Scheduler};

/// What the owner of a `RetryTimer` has to do after the timer fired.
#[derive(Debug, PartialEq)]
pub enum RetryStep<'a, P> {
    /// no answer yet, send the payload again
    Resend(&'a P),
    /// retry budget used up; reported exactly once
    Expired,
    /// the answer arrived in time, nothing to do
    Answered,
    /// timer was cancelled or already finished
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Running,
    Answered,
    Expired,
    Cancelled,
}

/// Bounded request/response retry on top of the scheduler.
///
/// The payload is sent once on `start`, then re-sent every
/// `timeout / (retries + 1)` seconds while the caller reports that no answer
/// arrived. After the last retry the next expiry yields `RetryStep::Expired`.
///
/// The timer does not own a callback; the scheduled event is supplied by the
/// owner and routed back to `fire`.
#[derive(Debug)]
pub struct RetryTimer<P> {
    payload: P,
    retries: u32,
    interval: SimTime,
    pending: Option<EventHandle>,
    state: TimerState,
}

impl<P> RetryTimer<P> {
    pub fn new(payload: P, retries: u32, timeout: SimTime) -> Self {
        Self {
            payload,
            retries,
            // fixed here; later changes of `retries` do not touch it
            interval: timeout / (retries as f64 + 1.0),
            pending: None,
            state: TimerState::Idle,
        }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn interval(&self) -> SimTime {
        self.interval
    }

    pub fn retries_left(&self) -> u32 {
        self.retries
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    pub fn is_running(&self) -> bool {
        self.state == TimerState::Running
    }

    pub fn is_expired(&self) -> bool {
        self.state == TimerState::Expired
    }

    /// Arms the first sub-interval and returns the payload for the initial send.
    /// Calling it on a running timer only returns the payload.
    pub fn start<E>(&mut self, scheduler: &Scheduler<E>, event: E) -> &P {
        if self.state == TimerState::Idle {
            self.state = TimerState::Running;
            self.pending = Some(scheduler.schedule_in(self.interval, event));
        }
        &self.payload
    }

    /// Handles expiry of a sub-interval. `event` is re-armed for the next one
    /// if a resend is due.
    pub fn fire<E>(&mut self, scheduler: &Scheduler<E>, event: E, answered: bool) -> RetryStep<'_, P> {
        self.pending = None;

        if self.state != TimerState::Running {
            return RetryStep::Inactive;
        }

        if answered {
            self.state = TimerState::Answered;
            return RetryStep::Answered;
        }

        if self.retries > 0 {
            self.retries -= 1;
            self.pending = Some(scheduler.schedule_in(self.interval, event));
            RetryStep::Resend(&self.payload)
        } else {
            self.state = TimerState::Expired;
            RetryStep::Expired
        }
    }

    /// Stops the timer; a later `fire` reports `Inactive`. Returns whether a
    /// scheduled expiry was still pending.
    pub fn cancel<E>(&mut self, scheduler: &Scheduler<E>) -> bool {
        let was_pending = match self.pending.take() {
            Some(handle) => scheduler.cancel(handle),
            None => false,
        };

        if self.state == TimerState::Running || self.state == TimerState::Idle {
            self.state = TimerState::Cancelled;
        }

        was_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: u8 = 1;

    /// Drives a timer to completion and records what happened when.
    fn run(timer: &mut RetryTimer<&'static str>, sched: &Scheduler<u8>, answer_at: Option<usize>) -> (Vec<SimTime>, usize) {
        let mut sends = vec![sched.now()];
        timer.start(sched, TICK);

        let mut expiries = 0;
        let mut fired = 0;
        while let Some((time, _)) = sched.next() {
            fired += 1;
            let answered = answer_at.map(|n| fired >= n).unwrap_or(false);
            match timer.fire(sched, TICK, answered) {
                RetryStep::Resend(_) => sends.push(time),
                RetryStep::Expired => expiries += 1,
                RetryStep::Answered | RetryStep::Inactive => {}
            }
        }

        (sends, expiries)
    }

    #[test]
    fn test_resends_until_budget_exhausted() {
        let sched: Scheduler<u8> = Scheduler::new();
        let mut timer = RetryTimer::new("req", 3, 8.0);

        assert_eq!(timer.interval(), 2.0);

        let (sends, expiries) = run(&mut timer, &sched, None);

        // initial send plus three retries, one expiry after the last interval
        assert_eq!(sends, vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(expiries, 1);
        assert_eq!(sched.now(), 8.0);
        assert!(timer.is_expired());
    }

    #[test]
    fn test_answer_stops_resending() {
        let sched: Scheduler<u8> = Scheduler::new();
        let mut timer = RetryTimer::new("req", 4, 10.0);

        let (sends, expiries) = run(&mut timer, &sched, Some(2));

        assert_eq!(sends, vec![0.0, 2.0]);
        assert_eq!(expiries, 0);
        assert!(sched.is_idle());
    }

    #[test]
    fn test_cancel_suppresses_timeout() {
        let sched: Scheduler<u8> = Scheduler::new();
        let mut timer = RetryTimer::new("req", 0, 1.0);
        timer.start(&sched, TICK);

        assert!(timer.cancel(&sched));
        assert!(sched.next().is_none());
        assert!(!timer.is_expired());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let sched: Scheduler<u8> = Scheduler::new();
        let mut timer = RetryTimer::new("req", 0, 1.0);
        timer.start(&sched, TICK);

        sched.next();
        assert_eq!(timer.fire(&sched, TICK, false), RetryStep::Expired);

        // nothing left to cancel, and no second expiry
        assert!(!timer.cancel(&sched));
        assert_eq!(timer.fire(&sched, TICK, false), RetryStep::Inactive);
    }

    #[test]
    fn test_interval_fixed_after_construction() {
        let sched: Scheduler<u8> = Scheduler::new();
        let mut timer = RetryTimer::new("req", 1, 4.0);
        timer.set_retries(3);

        assert_eq!(timer.interval(), 2.0);

        let (sends, expiries) = run(&mut timer, &sched, None);
        assert_eq!(sends, vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(expiries, 1);
    }

    #[test]
    fn test_start_twice_arms_once() {
        let sched: Scheduler<u8> = Scheduler::new();
        let mut timer = RetryTimer::new("req", 2, 3.0);

        assert_eq!(*timer.start(&sched, TICK), "req");
        timer.start(&sched, TICK);

        assert_eq!(sched.pending_count(), 1);
    }
}
