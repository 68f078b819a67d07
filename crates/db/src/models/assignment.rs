use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// The durable record binding one visitor to one variant within one
/// experiment. Created once, never mutated.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Assignment {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub visitor_id: String,
    pub variant_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Per-variant assignment counts for an experiment's results view.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct VariantAssignmentCount {
    pub variant_id: Uuid,
    pub name: String,
    pub is_control: bool,
    pub is_active: bool,
    pub assignments: i64,
}

const ASSIGNMENT_COLUMNS: &str = "id, experiment_id, visitor_id, variant_id, created_at";

impl Assignment {
    pub async fn find_by_experiment_and_visitor(
        pool: &SqlitePool,
        experiment_id: Uuid,
        visitor_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Assignment>(&format!(
            r#"SELECT {ASSIGNMENT_COLUMNS}
               FROM assignments
               WHERE experiment_id = $1 AND visitor_id = $2"#,
        ))
        .bind(experiment_id)
        .bind(visitor_id)
        .fetch_optional(pool)
        .await
    }

    /// Insert unless the visitor already holds an assignment for this
    /// experiment. `Ok(None)` means another writer got there first; the
    /// caller reselects the winning row.
    pub async fn try_insert(
        pool: &SqlitePool,
        id: Uuid,
        experiment_id: Uuid,
        visitor_id: &str,
        variant_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Assignment>(&format!(
            r#"INSERT INTO assignments (id, experiment_id, visitor_id, variant_id)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT(experiment_id, visitor_id) DO NOTHING
               RETURNING {ASSIGNMENT_COLUMNS}"#,
        ))
        .bind(id)
        .bind(experiment_id)
        .bind(visitor_id)
        .bind(variant_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn count_by_variant(
        pool: &SqlitePool,
        experiment_id: Uuid,
    ) -> Result<Vec<VariantAssignmentCount>, sqlx::Error> {
        sqlx::query_as::<_, VariantAssignmentCount>(
            r#"SELECT
                 v.id AS variant_id,
                 v.name,
                 v.is_control,
                 v.is_active,
                 COUNT(a.id) AS assignments
               FROM variants v
               LEFT JOIN assignments a ON a.variant_id = v.id
               WHERE v.experiment_id = $1
               GROUP BY v.id
               ORDER BY v.id ASC"#,
        )
        .bind(experiment_id)
        .fetch_all(pool)
        .await
    }
}
