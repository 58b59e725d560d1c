#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **pontoon-quota** – Atomic per-execution accounting of sampling rounds
//! and tokens.
//!
//! One [`QuotaLedger`] exists per bridge instance and is the bridge's only
//! shared mutable state. It is a monitor: a single mutex guards
//! `{rounds_used, tokens_used}` and every composite decision
//! (check-then-increment) lives inside one lock acquisition. The two
//! critical-section names, `rate-limit-check` and `rate-limit-update`, are
//! tracing spans over that one lock; they aid tracing and do not represent
//! distinct locks.
//!
//! The commit operations re-check both ceilings inside the update section,
//! so concurrent requests that all pass the read-only preflight still
//! cannot push a counter past its limit.
//!
//! `decrement_rounds` exists solely for the streaming rollback path, where
//! a round is booked optimistically before token usage is known.

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug_span;

/// Hard ceilings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Maximum number of sampling rounds.
    pub max_rounds: u32,
    /// Maximum cumulative input+output tokens.
    pub max_tokens: u32,
}

/// Usage counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    /// Rounds consumed so far.
    pub rounds_used: u32,
    /// Tokens consumed so far.
    pub tokens_used: u32,
}

/// Headroom left before the ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRemaining {
    /// Rounds left.
    pub rounds: u32,
    /// Tokens left.
    pub tokens: u32,
}

/// A denied quota decision. The display form is the user-facing 429 body
/// and always quantifies limit, usage, and remainder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// The round ceiling is reached.
    #[error("Rate limit exceeded: {used}/{limit} rounds used, {remaining} remaining")]
    RoundsExhausted {
        /// Rounds consumed.
        used: u32,
        /// Round ceiling.
        limit: u32,
        /// Rounds left.
        remaining: u32,
    },
    /// The token ceiling would be exceeded.
    #[error("Rate limit exceeded: {used}/{limit} tokens used, {remaining} remaining")]
    TokensExhausted {
        /// Tokens consumed.
        used: u32,
        /// Token ceiling.
        limit: u32,
        /// Tokens left.
        remaining: u32,
    },
}

#[derive(Debug, Default)]
struct QuotaState {
    rounds_used: u32,
    tokens_used: u32,
}

impl QuotaState {
    fn rounds_err(&self, limits: QuotaLimits) -> QuotaError {
        QuotaError::RoundsExhausted {
            used: self.rounds_used,
            limit: limits.max_rounds,
            remaining: limits.max_rounds.saturating_sub(self.rounds_used),
        }
    }

    fn tokens_err(&self, limits: QuotaLimits) -> QuotaError {
        QuotaError::TokensExhausted {
            used: self.tokens_used,
            limit: limits.max_tokens,
            remaining: limits.max_tokens.saturating_sub(self.tokens_used),
        }
    }
}

/// Monitor over the per-execution quota counters.
#[derive(Debug)]
pub struct QuotaLedger {
    limits: QuotaLimits,
    state: Mutex<QuotaState>,
}

impl QuotaLedger {
    /// Create a ledger with zeroed counters.
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(QuotaState::default()),
        }
    }

    /// The configured ceilings.
    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Whether another round fits under the ceiling.
    pub fn check_round_limit(&self) -> bool {
        let state = self.state.lock();
        state.rounds_used < self.limits.max_rounds
    }

    /// Whether `extra` more tokens fit under the ceiling.
    pub fn check_token_limit(&self, extra: u32) -> bool {
        let state = self.state.lock();
        state.tokens_used.saturating_add(extra) <= self.limits.max_tokens
    }

    /// Book one round unconditionally.
    pub fn increment_rounds(&self) {
        let mut state = self.state.lock();
        state.rounds_used = state.rounds_used.saturating_add(1);
    }

    /// Roll back one round. Saturates at zero.
    pub fn decrement_rounds(&self) {
        let mut state = self.state.lock();
        state.rounds_used = state.rounds_used.saturating_sub(1);
    }

    /// Book `n` tokens unconditionally.
    pub fn increment_tokens(&self, n: u32) {
        let mut state = self.state.lock();
        state.tokens_used = state.tokens_used.saturating_add(n);
    }

    /// Current counters.
    pub fn metrics(&self) -> QuotaSnapshot {
        let state = self.state.lock();
        QuotaSnapshot {
            rounds_used: state.rounds_used,
            tokens_used: state.tokens_used,
        }
    }

    /// Headroom left.
    pub fn remaining(&self) -> QuotaRemaining {
        let state = self.state.lock();
        QuotaRemaining {
            rounds: self.limits.max_rounds.saturating_sub(state.rounds_used),
            tokens: self.limits.max_tokens.saturating_sub(state.tokens_used),
        }
    }

    /// Read-only preflight: is there headroom for one more round at all?
    ///
    /// Critical section `rate-limit-check`. Mutates nothing.
    pub fn preflight(&self) -> Result<(), QuotaError> {
        let _section = debug_span!("rate-limit-check").entered();
        let state = self.state.lock();

        if state.rounds_used >= self.limits.max_rounds {
            return Err(state.rounds_err(self.limits));
        }
        if state.tokens_used > self.limits.max_tokens {
            return Err(state.tokens_err(self.limits));
        }
        Ok(())
    }

    /// Commit one completed unary round: re-check both ceilings for
    /// `tokens`, then book the round and the tokens together. On refusal
    /// nothing is mutated.
    ///
    /// Critical section `rate-limit-update`.
    pub fn commit_round(&self, tokens: u32) -> Result<(), QuotaError> {
        let _section = debug_span!("rate-limit-update").entered();
        let mut state = self.state.lock();

        if state.rounds_used >= self.limits.max_rounds {
            return Err(state.rounds_err(self.limits));
        }
        if state.tokens_used.saturating_add(tokens) > self.limits.max_tokens {
            return Err(state.tokens_err(self.limits));
        }

        state.rounds_used = state.rounds_used.saturating_add(1);
        state.tokens_used = state.tokens_used.saturating_add(tokens);
        Ok(())
    }

    /// Optimistically book the round for a streaming call whose token usage
    /// is unknown until the stream completes. Fails if the round ceiling is
    /// already reached, booking nothing.
    ///
    /// Critical section `rate-limit-update`.
    pub fn begin_streaming_round(&self) -> Result<(), QuotaError> {
        let _section = debug_span!("rate-limit-update").entered();
        let mut state = self.state.lock();

        if state.rounds_used >= self.limits.max_rounds {
            return Err(state.rounds_err(self.limits));
        }
        state.rounds_used = state.rounds_used.saturating_add(1);
        Ok(())
    }

    /// Settle a streaming round: book the observed tokens, or roll the
    /// optimistic round back if they exceed the ceiling.
    ///
    /// Critical section `rate-limit-update`.
    pub fn settle_streaming_round(&self, tokens: u32) -> Result<(), QuotaError> {
        let _section = debug_span!("rate-limit-update").entered();
        let mut state = self.state.lock();

        if state.tokens_used.saturating_add(tokens) > self.limits.max_tokens {
            let err = state.tokens_err(self.limits);
            state.rounds_used = state.rounds_used.saturating_sub(1);
            return Err(err);
        }

        state.tokens_used = state.tokens_used.saturating_add(tokens);
        Ok(())
    }

    /// Abandon a streaming round after an upstream failure.
    ///
    /// Critical section `rate-limit-update`.
    pub fn rollback_streaming_round(&self) {
        let _section = debug_span!("rate-limit-update").entered();
        let mut state = self.state.lock();
        state.rounds_used = state.rounds_used.saturating_sub(1);
    }
}
