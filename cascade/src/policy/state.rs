//! Exit Cascade — the per-input early-exit state machine
//!
//! ```text
//! Pending(0) ──c_0 ≥ τ_0──▶ Accepted
//!     │ c_0 < τ_0
//!     ▼
//! Pending(1) ──c_1 ≥ τ_1──▶ Accepted
//!     │ ...
//!     ▼
//! Pending(last) ─────────▶ Exhausted (forced: argmax at the last exit)
//! ```
//!
//! The cascade is fed one exit's calibrated score at a time, so an online
//! caller only computes a deeper exit while the cascade is still pending. It
//! never revisits an exit and charges exactly the exits it was fed.
//!
//! The last reachable exit is terminal by construction: an input that gets
//! there has been declined by every earlier threshold, and classification is
//! forced regardless of confidence. Its threshold is never consulted.

use serde::{Deserialize, Serialize};

use crate::profile::ExitProfile;

/// Calibrated top class and confidence observed at one exit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitScore {
    pub class: usize,
    pub confidence: f64,
}

/// Where and how an input was classified
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Acceptance {
    /// Exit index the input stopped at
    pub exit: usize,
    /// Calibrated top class at that exit
    pub class: usize,
    /// Calibrated top-class confidence at that exit
    pub confidence: f64,
    /// Sum of the costs of exits `0..=exit`
    pub cumulative_cost: f64,
    /// True when the last reachable exit forced the decision
    pub forced: bool,
}

/// Cascade state for one input
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyState {
    /// Awaiting the score of this exit
    Pending(usize),
    /// A threshold was met
    Accepted(Acceptance),
    /// Reached the last reachable exit without meeting a threshold
    Exhausted(Acceptance),
}

impl PolicyState {
    /// Whether no further exits will be consumed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending(_))
    }

    /// Terminal outcome, if reached
    pub fn acceptance(&self) -> Option<Acceptance> {
        match self {
            Self::Pending(_) => None,
            Self::Accepted(a) | Self::Exhausted(a) => Some(*a),
        }
    }
}

impl std::fmt::Display for PolicyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(exit) => write!(f, "pending({})", exit),
            Self::Accepted(a) => write!(f, "accepted@{}", a.exit),
            Self::Exhausted(a) => write!(f, "exhausted@{}", a.exit),
        }
    }
}

/// Step-wise early-exit decision for a single input
#[derive(Debug, Clone)]
pub struct ExitCascade<'a> {
    profile: &'a ExitProfile,
    thresholds: &'a [f64],
    last_exit: usize,
    cost: f64,
    state: PolicyState,
}

impl<'a> ExitCascade<'a> {
    /// Start at `Pending(0)`.
    ///
    /// `max_exit` restricts the deepest reachable exit (profiling variants);
    /// it is clamped to the profile's last exit.
    pub fn new(profile: &'a ExitProfile, thresholds: &'a [f64], max_exit: Option<usize>) -> Self {
        let deepest = profile.last_exit();
        let last_exit = max_exit.map_or(deepest, |m| m.min(deepest));
        Self {
            profile,
            thresholds,
            last_exit,
            cost: 0.0,
            state: PolicyState::Pending(0),
        }
    }

    /// Current state
    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// Exit whose score is needed next, if still pending
    pub fn next_exit(&self) -> Option<usize> {
        match self.state {
            PolicyState::Pending(exit) => Some(exit),
            _ => None,
        }
    }

    /// Deepest exit this cascade may visit
    pub fn last_exit(&self) -> usize {
        self.last_exit
    }

    /// Consume the score of the pending exit and transition.
    ///
    /// A terminal cascade ignores further scores.
    pub fn observe(&mut self, score: ExitScore) -> PolicyState {
        let PolicyState::Pending(exit) = self.state else {
            return self.state;
        };

        self.cost += self.profile.cost(exit);
        let acceptance = Acceptance {
            exit,
            class: score.class,
            confidence: score.confidence,
            cumulative_cost: self.cost,
            forced: false,
        };

        self.state = if exit >= self.last_exit {
            PolicyState::Exhausted(Acceptance {
                forced: true,
                ..acceptance
            })
        } else if score.confidence >= self.threshold(exit) {
            PolicyState::Accepted(acceptance)
        } else {
            PolicyState::Pending(exit + 1)
        };
        self.state
    }

    /// Feed scores from `scores` until terminal.
    ///
    /// Returns `Err(exit)` with the first exit the closure had no score for.
    pub fn run<F>(mut self, mut scores: F) -> Result<Acceptance, usize>
    where
        F: FnMut(usize) -> Option<ExitScore>,
    {
        while let Some(exit) = self.next_exit() {
            let score = scores(exit).ok_or(exit)?;
            self.observe(score);
        }
        self.state.acceptance().ok_or(self.last_exit)
    }

    fn threshold(&self, exit: usize) -> f64 {
        self.thresholds.get(exit).copied().unwrap_or(0.0)
    }
}
