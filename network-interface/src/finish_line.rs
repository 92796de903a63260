//! Exactly-once race resolution between concurrent completion attempts.
//!
//! A [`FinishLine`] is crossed at most once. Participants arrive either
//! strongly or weakly:
//!
//! - **Strong** arrivals ([`FinishLine::try_force`]) win whenever nothing has
//!   crossed the line yet.
//! - **Weak** arrivals ([`FinishLine::try_claim`]) count down the number of
//!   expected weak participants; only the last of them wins, and only if no
//!   strong arrival got there first.
//!
//! With one expected weak participant the weak path degenerates to "win if
//! nothing else has", which is how commands and alarms use it. Acquisition
//! races use the counting form so that the last failed acquisition of a round
//! learns that nobody in the round succeeded.
//!
//! The whole state is a single `AtomicU64`: the top bit marks the line as
//! crossed and the remaining bits hold the outstanding weak arrivals. Whoever
//! wins performs the side effects; everyone else must leave the shared result
//! alone.

use std::sync::atomic::{AtomicU64, Ordering};

const FINISHED: u64 = 1 << 63;

#[derive(Debug)]
pub struct FinishLine {
    state: AtomicU64,
}

impl FinishLine {
    /// Creates a line expecting `weak_participants` weak arrivals.
    ///
    /// A count of zero is treated as one so a weak arrival can always win an
    /// otherwise untouched line.
    pub fn new(weak_participants: u64) -> Self {
        Self {
            state: AtomicU64::new(weak_participants.clamp(1, FINISHED - 1)),
        }
    }

    /// A line where a single weak arrival suffices.
    pub fn single() -> Self {
        Self::new(1)
    }

    /// Strong arrival: wins if the line has not been crossed.
    pub fn try_force(&self) -> bool {
        self.state.fetch_or(FINISHED, Ordering::AcqRel) & FINISHED == 0
    }

    /// Weak arrival: wins only as the last expected weak participant on a line
    /// nobody else has crossed.
    pub fn try_claim(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & FINISHED != 0 {
                return false;
            }
            let (next, wins) = if current <= 1 {
                (FINISHED, true)
            } else {
                (current - 1, false)
            };
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return wins,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) & FINISHED != 0
    }
}

impl Default for FinishLine {
    fn default() -> Self {
        Self::single()
    }
}
