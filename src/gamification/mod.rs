//! Gamification: XP, levels, streaks, badges and duels.

pub mod duel;
pub mod progress;

pub use duel::{Duel, DuelSide, DuelStatus, Settlement};
pub use progress::{Badge, Profile, StreakChange, level_for_xp, xp_for_level};
