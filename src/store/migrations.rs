//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "templates_and_checklists",
        sql: r#"
            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                icon TEXT,
                sector_id TEXT,
                difficulty TEXT NOT NULL DEFAULT 'easy',
                estimated_minutes INTEGER NOT NULL,
                schedule TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Section membership lives in the per-question `section` JSON.
            CREATE TABLE IF NOT EXISTS template_questions (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                section TEXT NOT NULL,
                text TEXT NOT NULL,
                question_type TEXT NOT NULL,
                required INTEGER NOT NULL DEFAULT 0,
                weight INTEGER NOT NULL DEFAULT 1,
                points INTEGER,
                options TEXT NOT NULL DEFAULT '[]',
                conditional_rules TEXT NOT NULL DEFAULT '[]',
                media_instructions TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_template_questions_template
                ON template_questions(template_id, position);

            CREATE TABLE IF NOT EXISTS checklists (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL REFERENCES templates(id),
                user_id TEXT NOT NULL,
                sector_id TEXT,
                status TEXT NOT NULL DEFAULT 'in_progress',
                score INTEGER,
                conformity REAL,
                signature TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_checklists_user ON checklists(user_id);
            CREATE INDEX IF NOT EXISTS idx_checklists_template ON checklists(template_id);

            CREATE TABLE IF NOT EXISTS checklist_responses (
                checklist_id TEXT NOT NULL REFERENCES checklists(id) ON DELETE CASCADE,
                question_id TEXT NOT NULL,
                value TEXT,
                photo_urls TEXT NOT NULL DEFAULT '[]',
                comment TEXT,
                has_issue INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (checklist_id, question_id)
            );

            CREATE TABLE IF NOT EXISTS checklist_activity (
                checklist_id TEXT NOT NULL REFERENCES checklists(id) ON DELETE CASCADE,
                at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checklist_activity_checklist
                ON checklist_activity(checklist_id);
        "#,
    },
    Migration {
        version: 2,
        name: "template_versions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS template_versions (
                template_id TEXT NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
                version INTEGER NOT NULL,
                added INTEGER NOT NULL DEFAULT 0,
                removed INTEGER NOT NULL DEFAULT 0,
                modified INTEGER NOT NULL DEFAULT 0,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (template_id, version)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "action_plans",
        sql: r#"
            CREATE TABLE IF NOT EXISTS action_plans (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                problem TEXT NOT NULL DEFAULT '',
                due_date TEXT,
                cost_type TEXT NOT NULL DEFAULT 'none',
                estimated_cost TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                xp_reward INTEGER NOT NULL DEFAULT 0,
                xp_awarded INTEGER NOT NULL DEFAULT 0,
                evidence_urls TEXT NOT NULL DEFAULT '[]',
                checklist_id TEXT,
                question_id TEXT,
                notion_page_id TEXT UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_action_plans_status ON action_plans(status);
            CREATE INDEX IF NOT EXISTS idx_action_plans_checklist ON action_plans(checklist_id);
        "#,
    },
    Migration {
        version: 4,
        name: "gamification",
        sql: r#"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                display_name TEXT,
                total_xp INTEGER NOT NULL DEFAULT 0,
                level INTEGER NOT NULL DEFAULT 1,
                streak_days INTEGER NOT NULL DEFAULT 0,
                best_streak INTEGER NOT NULL DEFAULT 0,
                streak_shield_available INTEGER NOT NULL DEFAULT 0,
                last_completion_date TEXT,
                checklists_completed INTEGER NOT NULL DEFAULT 0,
                avatar_accessories TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS duels (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL,
                challenger_id TEXT NOT NULL,
                opponent_id TEXT NOT NULL,
                challenger_progress INTEGER NOT NULL DEFAULT 0,
                opponent_progress INTEGER NOT NULL DEFAULT 0,
                challenger_score INTEGER,
                opponent_score INTEGER,
                wager INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                winner TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_duels_status ON duels(status);
            CREATE INDEX IF NOT EXISTS idx_duels_challenger ON duels(challenger_id);
            CREATE INDEX IF NOT EXISTS idx_duels_opponent ON duels(opponent_id);
        "#,
    },
    Migration {
        version: 5,
        name: "draft_queues",
        sql: r#"
            -- `pending` mirrors the queue length and guards concurrent advances.
            CREATE TABLE IF NOT EXISTS draft_queues (
                checklist_id TEXT PRIMARY KEY REFERENCES checklists(id) ON DELETE CASCADE,
                queue TEXT NOT NULL,
                pending INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
];

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "templates",
            "template_questions",
            "template_versions",
            "checklists",
            "checklist_responses",
            "checklist_activity",
            "action_plans",
            "profiles",
            "duels",
            "draft_queues",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }
}
