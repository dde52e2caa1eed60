//! Feature extraction and the raw scoring function (§4.7).

use riftline_types::state::Side;
use riftline_types::MatchState;

/// Feature vector extracted from a match snapshot. All fields are clamped to
/// the ranges given in the contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features {
    /// `alive_A - alive_B`, in `-5..=5`.
    pub alive_diff: i32,
    /// `clamp((equip_A - equip_B) / 10_000, -1, 1)`.
    pub equip_diff: f64,
    /// `clamp((money_A - money_B) / 10_000, -1, 1)`. Extracted for parity
    /// with the source engine but not weighted by the current scoring
    /// contract (see `DESIGN.md`); reserved for a future model version.
    pub econ_diff: f64,
    /// Whether the bomb is currently planted.
    pub bomb_planted: bool,
    /// Team A's current side.
    pub team_a_side: Side,
    /// Team A's win streak, read off team B's consecutive round losses.
    pub win_streak_a: u32,
    /// Team B's win streak, read off team A's consecutive round losses.
    pub win_streak_b: u32,
    /// `(rating_A - rating_B) / 500`. No external rating feed is wired into
    /// this pipeline (out of scope), so this is always `0.0`; the weight
    /// stays part of the contract for when a feed is supplied.
    pub strength_diff: f64,
}

fn clamp_ratio(diff: i64, scale: f64) -> f64 {
    (diff as f64 / scale).clamp(-1.0, 1.0)
}

/// Extract the scoring feature vector from the current match state.
pub fn extract(state: &MatchState) -> Features {
    Features {
        alive_diff: state.team_a.alive_count as i32 - state.team_b.alive_count as i32,
        equip_diff: clamp_ratio(
            state.team_a.equipment_value as i64 - state.team_b.equipment_value as i64,
            10_000.0,
        ),
        econ_diff: clamp_ratio(
            state.team_a.money as i64 - state.team_b.money as i64,
            10_000.0,
        ),
        bomb_planted: state.bomb_planted,
        team_a_side: state.team_a.side,
        win_streak_a: state.team_b.consecutive_round_losses,
        win_streak_b: state.team_a.consecutive_round_losses,
        strength_diff: 0.0,
    }
}

/// Raw, undamped win-probability estimate for team A from a feature vector,
/// per the rule-based engine's weight contract. Clamped to `[0.05, 0.95]`.
pub fn raw_score(features: &Features) -> f64 {
    let mut p = 0.5
        + 0.1 * features.strength_diff
        + 0.15 * features.alive_diff as f64
        + 0.05 * features.equip_diff
        + 0.02 * (features.win_streak_a as f64 - features.win_streak_b as f64);

    if features.bomb_planted {
        match features.team_a_side {
            Side::T => p += 0.25,
            Side::CT => p -= 0.25,
        }
    }

    p.clamp(0.05, 0.95)
}

/// Confidence estimate from a feature vector, clamped to `[0.1, 0.95]`.
pub fn confidence(features: &Features, alive_a: u8, alive_b: u8) -> f64 {
    let mut c = 1.0 - (alive_a as f64 + alive_b as f64) / 10.0;
    if features.bomb_planted {
        c += 0.2;
    }
    c.clamp(0.1, 0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use riftline_types::state::Side;
    use uuid::Uuid;

    fn state() -> MatchState {
        MatchState::new("m1", Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn equal_teams_score_near_half() {
        let f = extract(&state());
        assert_eq!(raw_score(&f), 0.5);
    }

    #[test]
    fn alive_advantage_favors_team_a() {
        let mut s = state();
        s.team_b.alive_count = 2;
        let f = extract(&s);
        assert!(raw_score(&f) > 0.5);
    }

    #[test]
    fn bomb_planted_on_t_side_favors_team_a() {
        let mut s = state();
        s.bomb_planted = true;
        s.team_a.side = Side::T;
        let f = extract(&s);
        assert_eq!(raw_score(&f), 0.75);
    }

    #[test]
    fn bomb_planted_on_ct_side_disfavors_team_a() {
        let mut s = state();
        s.bomb_planted = true;
        s.team_a.side = Side::CT;
        let f = extract(&s);
        assert_eq!(raw_score(&f), 0.25);
    }

    #[test]
    fn score_never_leaves_its_clamp_range() {
        let mut s = state();
        s.team_a.alive_count = 5;
        s.team_b.alive_count = 0;
        s.bomb_planted = true;
        s.team_a.side = Side::T;
        let f = extract(&s);
        let p = raw_score(&f);
        assert!((0.05..=0.95).contains(&p));
    }

    #[test]
    fn confidence_rises_with_fewer_survivors_and_a_planted_bomb() {
        let mut s = state();
        s.team_a.alive_count = 1;
        s.team_b.alive_count = 0;
        s.bomb_planted = true;
        let f = extract(&s);
        let c = confidence(&f, s.team_a.alive_count, s.team_b.alive_count);
        assert!(c > 0.9);
        assert!(c <= 0.95);
    }
}
