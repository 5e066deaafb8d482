//! Achievement bookkeeping for gameplay events
//!
//! The simulation decides which achievements a kill unlocks; delivery to the
//! account API happens elsewhere and never blocks gameplay.

use crate::player::PlayerState;

pub const FIRST_CONNECTION: u32 = 1;
pub const FIRST_KILL: u32 = 2;
pub const FIVE_VICTIMS: u32 = 3;
pub const KNIFE_KILL: u32 = 5;
pub const FIRST_DEATH: u32 = 6;
pub const SUICIDE: u32 = 8;
pub const STREAK_5: u32 = 9;
pub const STREAK_10: u32 = 10;
pub const STREAK_20: u32 = 11;

/// Weapon slot of the melee weapon.
const KNIFE: u8 = 0;

/// Request to unlock one achievement for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unlock {
    pub account: String,
    pub id: u32,
}

impl Unlock {
    fn new(player: &PlayerState, id: u32) -> Self {
        Self {
            account: player.account.clone(),
            id,
        }
    }
}

/// Updates the killer's counters and returns the achievements earned by a
/// kill of `victim` by another player.
pub fn on_player_kill(killer: &mut PlayerState, victim: &PlayerState) -> Vec<Unlock> {
    killer.victims += 1;
    killer.score = killer.score.saturating_add(1);
    killer.streak = killer.streak.saturating_add(1);

    let mut unlocks = vec![Unlock::new(victim, FIRST_DEATH), Unlock::new(killer, FIRST_KILL)];
    if killer.victims == 5 {
        unlocks.push(Unlock::new(killer, FIVE_VICTIMS));
    }
    if killer.weapon == KNIFE {
        unlocks.push(Unlock::new(killer, KNIFE_KILL));
    }
    match killer.streak {
        5 => unlocks.push(Unlock::new(killer, STREAK_5)),
        10 => unlocks.push(Unlock::new(killer, STREAK_10)),
        20 => unlocks.push(Unlock::new(killer, STREAK_20)),
        _ => {}
    }
    unlocks
}

/// A player killed themselves: one point off, never below zero.
pub fn on_suicide(player: &mut PlayerState) -> Vec<Unlock> {
    player.score = player.score.saturating_sub(1);
    vec![Unlock::new(player, SUICIDE)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::Vector3;

    fn player(account: &str) -> PlayerState {
        PlayerState::new(0, account, account, Vector3::default())
    }

    fn ids(unlocks: &[Unlock], account: &str) -> Vec<u32> {
        unlocks
            .iter()
            .filter(|u| u.account == account)
            .map(|u| u.id)
            .collect()
    }

    #[test]
    fn test_first_kill_with_knife() {
        let mut killer = player("killer");
        let victim = player("victim");

        let unlocks = on_player_kill(&mut killer, &victim);

        assert_eq!(ids(&unlocks, "victim"), vec![FIRST_DEATH]);
        assert_eq!(ids(&unlocks, "killer"), vec![FIRST_KILL, KNIFE_KILL]);
        assert_eq!(killer.score, 1);
        assert_eq!(killer.streak, 1);
    }

    #[test]
    fn test_fifth_victim_and_streak() {
        let mut killer = player("killer");
        killer.weapon = 2;
        let victim = player("victim");

        let mut last = Vec::new();
        for _ in 0..5 {
            last = on_player_kill(&mut killer, &victim);
        }

        assert_eq!(ids(&last, "killer"), vec![FIRST_KILL, FIVE_VICTIMS, STREAK_5]);
    }

    #[test]
    fn test_suicide_floors_score_at_zero() {
        let mut p = player("p");
        assert_eq!(ids(&on_suicide(&mut p), "p"), vec![SUICIDE]);
        assert_eq!(p.score, 0);

        p.score = 3;
        on_suicide(&mut p);
        assert_eq!(p.score, 2);
    }
}
