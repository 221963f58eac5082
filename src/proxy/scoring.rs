//! Score transitions applied after every validation

use crate::proxy::models::ValidationOutcome;

/// Default score of a freshly admitted or rehabilitated proxy
pub const DEFAULT_MAX_SCORE: u32 = 50;

/// What to do with a record after scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreAction {
    Keep,
    Evict,
}

/// Maps a validation outcome and the current score to the next score.
///
/// A failure costs exactly one point and a success restores the full score,
/// so a flaky proxy that comes back is immediately trusted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringPolicy {
    max_score: u32,
}

impl ScoringPolicy {
    pub fn new(max_score: u32) -> Self {
        Self {
            max_score: max_score.max(1),
        }
    }

    pub fn max_score(&self) -> u32 {
        self.max_score
    }

    pub fn apply(&self, current: u32, outcome: &ValidationOutcome) -> (u32, ScoreAction) {
        if outcome.is_usable() {
            return (self.max_score, ScoreAction::Keep);
        }

        let score = current.min(self.max_score).saturating_sub(1);
        if score == 0 {
            (0, ScoreAction::Evict)
        } else {
            (score, ScoreAction::Keep)
        }
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCORE)
    }
}
