//! Action plans: remediation tasks raised by non-conformities.

pub mod model;
pub mod notion;

pub use model::{ActionPlan, ActionPlanStatus, CostType};
pub use notion::{NotionClient, SyncReport};

use crate::error::DatabaseError;
use crate::store::Database;

/// Credit resolution XP to the plan owner. Plans owned by the remote
/// workspace have no profile to credit.
pub async fn award_resolution_xp(
    db: &dyn Database,
    user_id: &str,
    xp: u32,
) -> Result<(), DatabaseError> {
    if xp == 0 || user_id == notion::REMOTE_OWNER {
        return Ok(());
    }
    db.add_xp(user_id, i64::from(xp)).await?;
    Ok(())
}
