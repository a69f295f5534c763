//! Security score and grade. Both are pure functions of their inputs.

use crate::model::{Grade, Severity};

pub const MAX_SCORE: f64 = 10.0;
pub const CHAIN_PENALTY_FACTOR: f64 = 0.5;

/// Round half-up to one decimal.
pub fn round_one_decimal(x: f64) -> f64 {
    // The epsilon absorbs binary representation error (e.g. 7.05 stored as 7.0499…).
    ((x * 10.0) + 0.5 + 1e-9).floor() / 10.0
}

/// Start at 10, subtract per-finding severity penalties (floored at 0), then
/// deduct `0.5 × exploitability/10` per chain, clamp and round.
pub fn compute_score<I, C>(severities: I, chain_exploitability: C) -> f64
where
    I: IntoIterator<Item = Severity>,
    C: IntoIterator<Item = f64>,
{
    let penalty: f64 = severities.into_iter().map(Severity::penalty).sum();
    let mut score = (MAX_SCORE - penalty).max(0.0);
    for e in chain_exploitability {
        score -= CHAIN_PENALTY_FACTOR * e.clamp(0.0, 10.0) / 10.0;
    }
    round_one_decimal(score.clamp(0.0, MAX_SCORE))
}

pub fn grade_for(score: f64) -> Grade {
    if score >= 9.0 {
        Grade::APlus
    } else if score >= 8.0 {
        Grade::A
    } else if score >= 7.0 {
        Grade::B
    } else if score >= 6.0 {
        Grade::C
    } else if score >= 5.0 {
        Grade::D
    } else {
        Grade::F
    }
}

/// Some writers stored `score × 10` as an integer. Anything above the scale
/// is one of those.
pub fn normalize_stored_score(raw: f64) -> f64 {
    let s = if raw > MAX_SCORE { raw / 10.0 } else { raw };
    round_one_decimal(s.clamp(0.0, MAX_SCORE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_site_scores_ten() {
        assert_eq!(compute_score(Vec::new(), Vec::new()), 10.0);
        assert_eq!(grade_for(10.0), Grade::APlus);
    }

    #[test]
    fn penalties_and_chain_deduction() {
        // 10 - 2.5 - 1.2 - 0.4 - 0.1 = 5.8; chain 8.0 -> -0.4 => 5.4
        let s = compute_score(
            vec![Severity::Critical, Severity::High, Severity::Medium, Severity::Low, Severity::Info],
            vec![8.0],
        );
        assert_eq!(s, 5.4);
        assert_eq!(grade_for(s), Grade::D);
    }

    #[test]
    fn floor_at_zero() {
        let s = compute_score(vec![Severity::Critical; 6], vec![10.0]);
        assert_eq!(s, 0.0);
        assert_eq!(grade_for(s), Grade::F);
    }

    #[test]
    fn grade_boundaries() {
        assert_eq!(grade_for(9.0), Grade::APlus);
        assert_eq!(grade_for(8.9), Grade::A);
        assert_eq!(grade_for(7.0), Grade::B);
        assert_eq!(grade_for(6.0), Grade::C);
        assert_eq!(grade_for(5.0), Grade::D);
        assert_eq!(grade_for(4.9), Grade::F);
    }

    #[test]
    fn rounds_half_up() {
        assert_eq!(round_one_decimal(7.05), 7.1);
        assert_eq!(round_one_decimal(7.04), 7.0);
    }

    #[test]
    fn legacy_scores_are_normalized() {
        assert_eq!(normalize_stored_score(85.0), 8.5);
        assert_eq!(normalize_stored_score(8.5), 8.5);
    }
}
