use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

use crate::percent::Percent;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Variant {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub name: String,
    pub is_control: bool,
    /// Inactive variants are excluded from allocation; their assignment
    /// history stays intact.
    pub is_active: bool,
    #[ts(type = "number")]
    pub traffic_percentage: Percent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateVariant {
    pub name: String,
    pub is_control: Option<bool>,
    #[ts(type = "number")]
    pub traffic_percentage: Percent,
}

#[derive(Debug, Serialize, Deserialize, TS)]
pub struct UpdateVariant {
    pub name: Option<String>,
    #[ts(type = "number | null")]
    pub traffic_percentage: Option<Percent>,
}

const VARIANT_COLUMNS: &str =
    "id, experiment_id, name, is_control, is_active, traffic_percentage, created_at, updated_at";

impl Variant {
    pub async fn create(
        pool: &SqlitePool,
        experiment_id: Uuid,
        data: &CreateVariant,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let is_control = data.is_control.unwrap_or(false);
        sqlx::query_as::<_, Variant>(&format!(
            r#"INSERT INTO variants (id, experiment_id, name, is_control, traffic_percentage)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING {VARIANT_COLUMNS}"#,
        ))
        .bind(id)
        .bind(experiment_id)
        .bind(&data.name)
        .bind(is_control)
        .bind(data.traffic_percentage)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Variant>(&format!(
            r#"SELECT {VARIANT_COLUMNS}
               FROM variants
               WHERE id = $1"#,
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_experiment_id(
        pool: &SqlitePool,
        experiment_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Variant>(&format!(
            r#"SELECT {VARIANT_COLUMNS}
               FROM variants
               WHERE experiment_id = $1
               ORDER BY created_at ASC"#,
        ))
        .bind(experiment_id)
        .fetch_all(pool)
        .await
    }

    /// Active variants in allocation order.
    ///
    /// Ordered by id so bucket boundaries never depend on insertion or
    /// caller ordering.
    pub async fn find_active_by_experiment_id(
        pool: &SqlitePool,
        experiment_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Variant>(&format!(
            r#"SELECT {VARIANT_COLUMNS}
               FROM variants
               WHERE experiment_id = $1 AND is_active = 1
               ORDER BY id ASC"#,
        ))
        .bind(experiment_id)
        .fetch_all(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateVariant,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Variant>(&format!(
            r#"UPDATE variants
               SET name = COALESCE($2, name),
                   traffic_percentage = COALESCE($3, traffic_percentage),
                   updated_at = CURRENT_TIMESTAMP
               WHERE id = $1
               RETURNING {VARIANT_COLUMNS}"#,
        ))
        .bind(id)
        .bind(data.name.clone())
        .bind(data.traffic_percentage)
        .fetch_one(pool)
        .await
    }

    pub async fn set_active(
        pool: &SqlitePool,
        id: Uuid,
        is_active: bool,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Variant>(&format!(
            r#"UPDATE variants
               SET is_active = $2,
                   updated_at = CURRENT_TIMESTAMP
               WHERE id = $1
               RETURNING {VARIANT_COLUMNS}"#,
        ))
        .bind(id)
        .bind(is_active)
        .fetch_one(pool)
        .await
    }

    /// Sum of active traffic weights (hundredths), optionally excluding one
    /// variant. Used to keep the active total at or below 100%.
    pub async fn active_traffic_total(
        pool: &SqlitePool,
        experiment_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<i64, sqlx::Error> {
        let total = sqlx::query_scalar::<_, Option<i64>>(
            r#"SELECT SUM(traffic_percentage)
               FROM variants
               WHERE experiment_id = $1
                 AND is_active = 1
                 AND ($2 IS NULL OR id != $2)"#,
        )
        .bind(experiment_id)
        .bind(exclude)
        .fetch_one(pool)
        .await?;
        Ok(total.unwrap_or(0))
    }
}
