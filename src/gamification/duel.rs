//! Head-to-head duels on a template, with an XP wager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::DuelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelStatus {
    Pending,
    Active,
    Declined,
    Completed,
}

impl DuelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Declined => "declined",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "declined" => Some(Self::Declined),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Declined | Self::Completed)
    }
}

impl std::fmt::Display for DuelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant's standing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuelSide {
    pub user_id: String,
    /// Answered share of the template, 0..=100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
}

impl DuelSide {
    fn new(user_id: String) -> Self {
        Self {
            user_id,
            progress: 0,
            score: None,
        }
    }

    pub fn finished(&self) -> bool {
        self.score.is_some()
    }
}

/// XP movements produced when a duel closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub duel_id: Uuid,
    /// `None` on a tie.
    pub winner: Option<String>,
    pub loser: Option<String>,
    pub wager: u32,
}

impl Settlement {
    /// Signed XP change for `user_id`.
    pub fn xp_delta(&self, user_id: &str) -> i64 {
        let wager = i64::from(self.wager);
        match (&self.winner, &self.loser) {
            (Some(w), _) if w == user_id => wager,
            (_, Some(l)) if l == user_id => -wager,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Duel {
    pub id: Uuid,
    pub template_id: Uuid,
    pub challenger: DuelSide,
    pub opponent: DuelSide,
    pub wager: u32,
    pub status: DuelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Duel {
    pub fn new(
        template_id: Uuid,
        challenger: impl Into<String>,
        opponent: impl Into<String>,
        wager: u32,
    ) -> Result<Self, DuelError> {
        let challenger = challenger.into();
        let opponent = opponent.into();
        if challenger == opponent {
            return Err(DuelError::SameParticipant);
        }
        if wager == 0 {
            return Err(DuelError::InvalidWager);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            template_id,
            challenger: DuelSide::new(challenger),
            opponent: DuelSide::new(opponent),
            wager,
            status: DuelStatus::Pending,
            winner: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.challenger.user_id == user_id || self.opponent.user_id == user_id
    }

    fn side_mut(&mut self, user_id: &str) -> Result<&mut DuelSide, DuelError> {
        if self.challenger.user_id == user_id {
            Ok(&mut self.challenger)
        } else if self.opponent.user_id == user_id {
            Ok(&mut self.opponent)
        } else {
            Err(DuelError::NotParticipant {
                id: self.id,
                user: user_id.to_string(),
            })
        }
    }

    fn guard(&self, expected: DuelStatus, action: &str) -> Result<(), DuelError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(DuelError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                action: action.to_string(),
            })
        }
    }

    /// Only the challenged user may accept.
    pub fn accept(&mut self, user_id: &str) -> Result<(), DuelError> {
        self.guard(DuelStatus::Pending, "accept")?;
        if self.opponent.user_id != user_id {
            return Err(DuelError::NotParticipant {
                id: self.id,
                user: user_id.to_string(),
            });
        }
        self.status = DuelStatus::Active;
        self.updated_at = Utc::now();
        info!(duel_id = %self.id, "Duel accepted");
        Ok(())
    }

    pub fn decline(&mut self, user_id: &str) -> Result<(), DuelError> {
        self.guard(DuelStatus::Pending, "decline")?;
        if self.opponent.user_id != user_id {
            return Err(DuelError::NotParticipant {
                id: self.id,
                user: user_id.to_string(),
            });
        }
        self.status = DuelStatus::Declined;
        self.updated_at = Utc::now();
        info!(duel_id = %self.id, "Duel declined");
        Ok(())
    }

    pub fn record_progress(&mut self, user_id: &str, progress: u8) -> Result<(), DuelError> {
        self.guard(DuelStatus::Active, "progress")?;
        let side = self.side_mut(user_id)?;
        side.progress = progress.min(100);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a finished run. Settles once both sides are in.
    pub fn record_score(
        &mut self,
        user_id: &str,
        score: u32,
    ) -> Result<Option<Settlement>, DuelError> {
        self.guard(DuelStatus::Active, "score")?;
        let side = self.side_mut(user_id)?;
        if side.finished() {
            return Err(DuelError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                action: "score".into(),
            });
        }
        side.progress = 100;
        side.score = Some(score);
        self.updated_at = Utc::now();

        if self.challenger.finished() && self.opponent.finished() {
            Ok(Some(self.settle()))
        } else {
            Ok(None)
        }
    }

    fn settle(&mut self) -> Settlement {
        let a = self.challenger.score.unwrap_or(0);
        let b = self.opponent.score.unwrap_or(0);
        let (winner, loser) = match a.cmp(&b) {
            std::cmp::Ordering::Greater => (
                Some(self.challenger.user_id.clone()),
                Some(self.opponent.user_id.clone()),
            ),
            std::cmp::Ordering::Less => (
                Some(self.opponent.user_id.clone()),
                Some(self.challenger.user_id.clone()),
            ),
            std::cmp::Ordering::Equal => (None, None),
        };
        self.status = DuelStatus::Completed;
        self.winner = winner.clone();
        info!(
            duel_id = %self.id,
            winner = winner.as_deref().unwrap_or("tie"),
            wager = self.wager,
            "Duel settled"
        );
        Settlement {
            duel_id: self.id,
            winner,
            loser,
            wager: self.wager,
        }
    }
}
