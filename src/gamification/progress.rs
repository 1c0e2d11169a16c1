//! Player progress: XP, levels, streaks and badges.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// XP step between levels; level `n + 1` needs `XP_PER_LEVEL_STEP * n(n+1)/2` total.
pub const XP_PER_LEVEL_STEP: u64 = 250;

/// Streak length that re-arms the streak shield.
pub const SHIELD_EVERY_DAYS: u32 = 7;

/// Total XP needed to reach `level`.
pub fn xp_for_level(level: u32) -> u64 {
    let n = u64::from(level.saturating_sub(1));
    XP_PER_LEVEL_STEP * n * (n + 1) / 2
}

pub fn level_for_xp(xp: u64) -> u32 {
    let mut level = 1;
    while xp >= xp_for_level(level + 1) {
        level += 1;
    }
    level
}

/// How a completion affected the streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakChange {
    /// Already completed something that day.
    Unchanged,
    Extended,
    /// One missed day bridged by the shield.
    ShieldUsed,
    Reset,
}

/// Unlockable achievements, derived from profile counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    FirstChecklist,
    WeekStreak,
    MonthStreak,
    Level5,
    Level10,
    Centurion,
}

/// Gamification counters for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub total_xp: u64,
    pub level: u32,
    pub streak_days: u32,
    pub best_streak: u32,
    pub streak_shield_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completion_date: Option<NaiveDate>,
    pub checklists_completed: u32,
    /// Avatar items as `slot:item` pairs, e.g. `hat:chef`.
    #[serde(default)]
    pub avatar_accessories: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            total_xp: 0,
            level: 1,
            streak_days: 0,
            best_streak: 0,
            streak_shield_available: false,
            last_completion_date: None,
            checklists_completed: 0,
            avatar_accessories: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Add (or remove) XP, never going below zero. Returns the new level.
    pub fn award_xp(&mut self, delta: i64) -> u32 {
        let before = self.level;
        self.total_xp = if delta >= 0 {
            self.total_xp.saturating_add(delta as u64)
        } else {
            self.total_xp.saturating_sub(delta.unsigned_abs())
        };
        self.level = level_for_xp(self.total_xp);
        self.updated_at = Utc::now();
        if self.level > before {
            info!(user_id = %self.user_id, level = self.level, "Level up");
        }
        self.level
    }

    /// Register a completed checklist on `date` and update the streak.
    pub fn record_completion(&mut self, date: NaiveDate) -> StreakChange {
        self.checklists_completed += 1;
        self.updated_at = Utc::now();

        let change = match self.last_completion_date {
            Some(last) if date <= last => StreakChange::Unchanged,
            Some(last) => match (date - last).num_days() {
                1 => StreakChange::Extended,
                2 if self.streak_shield_available => StreakChange::ShieldUsed,
                _ => StreakChange::Reset,
            },
            None => StreakChange::Reset,
        };

        match change {
            StreakChange::Unchanged => return change,
            StreakChange::Extended => self.streak_days += 1,
            StreakChange::ShieldUsed => {
                self.streak_shield_available = false;
                self.streak_days += 1;
            }
            StreakChange::Reset => self.streak_days = 1,
        }

        self.last_completion_date = Some(date);
        self.best_streak = self.best_streak.max(self.streak_days);
        if self.streak_days % SHIELD_EVERY_DAYS == 0 {
            self.streak_shield_available = true;
        }
        debug!(
            user_id = %self.user_id,
            streak = self.streak_days,
            change = ?change,
            "Streak updated"
        );
        change
    }

    pub fn badges(&self) -> Vec<Badge> {
        let mut badges = Vec::new();
        if self.checklists_completed >= 1 {
            badges.push(Badge::FirstChecklist);
        }
        if self.best_streak >= 7 {
            badges.push(Badge::WeekStreak);
        }
        if self.best_streak >= 30 {
            badges.push(Badge::MonthStreak);
        }
        if self.level >= 5 {
            badges.push(Badge::Level5);
        }
        if self.level >= 10 {
            badges.push(Badge::Level10);
        }
        if self.checklists_completed >= 100 {
            badges.push(Badge::Centurion);
        }
        badges
    }

    /// Parse the stored `slot:item,slot:item` accessory encoding.
    pub fn parse_accessories(encoded: &str) -> Vec<String> {
        encoded
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn encode_accessories(&self) -> String {
        self.avatar_accessories.join(",")
    }
}
