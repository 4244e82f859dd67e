use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    abort::AbortSignal,
    error::{PingpongError, Result},
};

struct BarrierState {
    count: usize,
    phase: bool,
}

/// Sense-reversing barrier across a fixed number of execution contexts.
/// Reusable for any number of phases; each participant keeps its own toggle
/// in its [`BarrierHandle`].
pub struct Barrier {
    participants: usize,
    state: Mutex<BarrierState>,
    abort: AbortSignal,
}

impl Barrier {
    /// Returns one handle per participant.
    pub fn new(participants: usize, abort: AbortSignal) -> Result<Vec<BarrierHandle>> {
        if participants == 0 {
            return Err(PingpongError::Config("barrier needs at least one participant".into()));
        }
        let barrier = Arc::new(Barrier {
            participants,
            state: Mutex::new(BarrierState { count: 0, phase: false }),
            abort,
        });
        Ok((0..participants)
            .map(|_| BarrierHandle { barrier: barrier.clone(), toggle: false })
            .collect())
    }

    pub fn participants(&self) -> usize {
        self.participants
    }
}

pub struct BarrierHandle {
    barrier: Arc<Barrier>,
    toggle: bool,
}

impl BarrierHandle {
    /// Returns once every participant has called `wait` for this phase.
    pub fn wait(&mut self) -> Result<()> {
        self.toggle = !self.toggle;
        let barrier = &*self.barrier;
        {
            let mut state = barrier.state.lock();
            state.count += 1;
            if state.count == barrier.participants {
                state.count = 0;
                state.phase = self.toggle;
                return Ok(());
            }
        }
        loop {
            if barrier.state.lock().phase == self.toggle {
                return Ok(());
            }
            barrier.abort.check()?;
            std::hint::spin_loop();
        }
    }

    pub fn participants(&self) -> usize {
        self.barrier.participants()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn run_phases(participants: usize, phases: usize) {
        let handles = Barrier::new(participants, AbortSignal::new()).unwrap();
        let arrivals = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            for mut handle in handles {
                let arrivals = arrivals.clone();
                s.spawn(move || {
                    for phase in 0..phases {
                        arrivals.fetch_add(1, Ordering::SeqCst);
                        handle.wait().unwrap();
                        // Nobody leaves phase `p` before all arrived for it.
                        assert!(arrivals.load(Ordering::SeqCst) >= (phase + 1) * participants);
                        handle.wait().unwrap();
                    }
                });
            }
        });
        assert_eq!(arrivals.load(Ordering::SeqCst), phases * participants);
    }

    #[test]
    fn single_participant_is_noop() {
        let mut handles = Barrier::new(1, AbortSignal::new()).unwrap();
        for _ in 0..1000 {
            handles[0].wait().unwrap();
        }
    }

    #[test]
    fn two_participants() {
        run_phases(2, 500);
    }

    #[test]
    fn five_participants() {
        run_phases(5, 200);
    }

    #[test]
    fn eighty_participants() {
        run_phases(80, 10);
    }

    #[test]
    fn zero_participants_rejected() {
        assert!(Barrier::new(0, AbortSignal::new()).is_err());
    }

    #[test]
    fn abort_releases_waiters() {
        let abort = AbortSignal::new();
        let mut handles = Barrier::new(2, abort.clone()).unwrap();
        let mut waiter = handles.pop().unwrap();
        let t = std::thread::spawn(move || waiter.wait());
        abort.raise();
        assert!(matches!(t.join().unwrap(), Err(PingpongError::Aborted)));
    }
}
