//! Turn arbitration: the single owner of the conversation turn counter.
//!
//! Every inbound message and every asynchronous callback is checked against
//! the arbiter before it may touch state. Advancing the turn retires whatever
//! audio belongs to the previous turn before returning, so code running after
//! `advance` in the same call stack can rely on the old engine being inert.

/// State that lives only as long as one turn (audio engines, chunk
/// bookkeeping). The arbiter drives it on every turn change.
pub trait TurnScoped {
    /// Synchronously tear down everything that belonged to `previous`.
    fn retire_turn(&mut self, previous: u64, reason: &str);

    /// Drop all turn-scoped state unconditionally (session re-initiation).
    fn reset(&mut self);
}

#[derive(Debug, Default)]
pub struct TurnArbiter {
    current: u64,
}

impl TurnArbiter {
    pub fn new() -> Self {
        Self { current: 0 }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Move to `turn` if it is ahead of the current one.
    ///
    /// Returns `true` when the turn actually changed. The previous turn's
    /// scoped state has been retired by the time this returns.
    pub fn advance<S: TurnScoped + ?Sized>(&mut self, turn: u64, reason: &str, scoped: &mut S) -> bool {
        if turn <= self.current {
            return false;
        }
        let previous = self.current;
        self.current = turn;
        log::debug!("turn {} -> {} ({})", previous, turn, reason);
        scoped.retire_turn(previous, reason);
        true
    }

    /// `true` iff the message names a turn behind the current one.
    pub fn is_stale(&self, turn: Option<u64>) -> bool {
        matches!(turn, Some(t) if t < self.current)
    }

    pub fn is_current(&self, turn: u64) -> bool {
        turn == self.current
    }

    /// Hard reset on session (re)initiation. Bypasses the monotonic check.
    pub fn reset<S: TurnScoped + ?Sized>(&mut self, base_turn: u64, scoped: &mut S) {
        log::info!("turn counter reset {} -> {}", self.current, base_turn);
        self.current = base_turn;
        scoped.reset();
    }
}
