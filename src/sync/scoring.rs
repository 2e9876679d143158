//! Bet scoring rules.
//!
//! A prediction earns the best tier it satisfies:
//!
//! | tier       | football                     | rugby                                        |
//! |------------|------------------------------|----------------------------------------------|
//! | exact      | exact score                  | exact score                                  |
//! | difference | same goal difference         | right winner, margin within `RUGBY_MARGIN`   |
//! | outcome    | right winner or draw         | right winner or draw                         |
//!
//! Points per tier come from the competition's `ScoringSystem`.
use std::cmp::Ordering;

use crate::db::models::{ScorePair, ScoringSystem, Sport};

/// Largest gap between predicted and actual margin still counted as "close".
pub const RUGBY_MARGIN: i32 = 5;

/// Points for one prediction against the final score.
pub fn calculate_bet_points(
    predicted: ScorePair,
    actual: ScorePair,
    scoring: &ScoringSystem,
    sport: Sport,
) -> i32 {
    if predicted == actual {
        return scoring.exact;
    }

    let predicted_margin = predicted.home - predicted.away;
    let actual_margin = actual.home - actual.away;
    let same_outcome = predicted_margin.cmp(&0) == actual_margin.cmp(&0);
    if !same_outcome {
        return 0;
    }

    let close = match sport {
        Sport::Football => predicted_margin == actual_margin,
        // A predicted draw only earns the outcome tier unless exact.
        Sport::Rugby => {
            actual_margin.cmp(&0) != Ordering::Equal
                && (predicted_margin - actual_margin).abs() <= RUGBY_MARGIN
        }
    };

    if close {
        scoring.difference
    } else {
        scoring.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(p: (i32, i32), a: (i32, i32), sport: Sport) -> i32 {
        calculate_bet_points(
            ScorePair::new(p.0, p.1),
            ScorePair::new(a.0, a.1),
            &ScoringSystem::default(),
            sport,
        )
    }

    #[test]
    fn test_football_tiers() {
        assert_eq!(pts((2, 1), (2, 1), Sport::Football), 3);
        assert_eq!(pts((3, 2), (2, 1), Sport::Football), 2);
        assert_eq!(pts((1, 1), (2, 2), Sport::Football), 2);
        assert_eq!(pts((3, 0), (2, 1), Sport::Football), 1);
        assert_eq!(pts((0, 1), (2, 1), Sport::Football), 0);
        assert_eq!(pts((1, 1), (2, 1), Sport::Football), 0);
    }

    #[test]
    fn test_rugby_margin_tier() {
        assert_eq!(pts((24, 20), (24, 20), Sport::Rugby), 3);
        // margin 4 vs 7 → close
        assert_eq!(pts((24, 20), (27, 20), Sport::Rugby), 2);
        // margin 20 vs 7 → outcome only
        assert_eq!(pts((40, 20), (27, 20), Sport::Rugby), 1);
        assert_eq!(pts((10, 20), (27, 20), Sport::Rugby), 0);
        assert_eq!(pts((15, 15), (20, 20), Sport::Rugby), 1);
    }

    #[test]
    fn test_custom_scoring_system() {
        let scoring = ScoringSystem {
            exact: 10,
            difference: 5,
            outcome: 2,
        };
        let p = calculate_bet_points(
            ScorePair::new(1, 0),
            ScorePair::new(2, 1),
            &scoring,
            Sport::Football,
        );
        assert_eq!(p, 5);
    }
}
