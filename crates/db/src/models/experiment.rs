use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

use crate::percent::Percent;

#[derive(
    Debug, Clone, Type, Serialize, Deserialize, PartialEq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "experiment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

impl ExperimentStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, next),
            (Draft, Running)
                | (Draft, Archived)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Archived)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Archived)
                | (Completed, Archived)
        )
    }
}

/// Assignment algorithm configured for an experiment.
///
/// Stored as configuration; allocation always runs the uniform weighted
/// split. The bandit variants reserve the column values the dashboard can
/// select.
#[derive(
    Debug, Clone, Type, Serialize, Deserialize, PartialEq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "experiment_algorithm", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Uniform,
    ThompsonSampling,
    Ucb1,
    EpsilonGreedy,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Experiment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: ExperimentStatus,
    pub algorithm: Algorithm,
    /// Share of the overall visitor population admitted into the experiment.
    #[ts(type = "number")]
    pub traffic_allocation: Percent,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateExperiment {
    pub name: String,
    pub description: Option<String>,
    pub algorithm: Option<Algorithm>,
    #[ts(type = "number | null")]
    pub traffic_allocation: Option<Percent>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
pub struct UpdateExperiment {
    pub name: Option<String>,
    pub description: Option<String>,
    pub algorithm: Option<Algorithm>,
    #[ts(type = "number | null")]
    pub traffic_allocation: Option<Percent>,
}

const EXPERIMENT_COLUMNS: &str = r#"id, project_id, name, description, status, algorithm,
traffic_allocation, started_at, ended_at, created_at, updated_at"#;

impl Experiment {
    pub async fn create(
        pool: &SqlitePool,
        project_id: Uuid,
        data: &CreateExperiment,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        let algorithm = data.algorithm.clone().unwrap_or_default();
        let traffic_allocation = data.traffic_allocation.unwrap_or(Percent::FULL);
        sqlx::query_as::<_, Experiment>(&format!(
            r#"INSERT INTO experiments (id, project_id, name, description, algorithm, traffic_allocation)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING {EXPERIMENT_COLUMNS}"#,
        ))
        .bind(id)
        .bind(project_id)
        .bind(&data.name)
        .bind(data.description.clone())
        .bind(algorithm)
        .bind(traffic_allocation)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Experiment>(&format!(
            r#"SELECT {EXPERIMENT_COLUMNS}
               FROM experiments
               WHERE id = $1"#,
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_project_id(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Experiment>(&format!(
            r#"SELECT {EXPERIMENT_COLUMNS}
               FROM experiments
               WHERE project_id = $1
               ORDER BY created_at DESC"#,
        ))
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateExperiment,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Experiment>(&format!(
            r#"UPDATE experiments
               SET name = COALESCE($2, name),
                   description = COALESCE($3, description),
                   algorithm = COALESCE($4, algorithm),
                   traffic_allocation = COALESCE($5, traffic_allocation),
                   updated_at = CURRENT_TIMESTAMP
               WHERE id = $1
               RETURNING {EXPERIMENT_COLUMNS}"#,
        ))
        .bind(id)
        .bind(data.name.clone())
        .bind(data.description.clone())
        .bind(data.algorithm.clone())
        .bind(data.traffic_allocation)
        .fetch_one(pool)
        .await
    }

    /// Move the experiment to `status`, stamping lifecycle timestamps.
    ///
    /// `started_at` is set once, the first time the experiment enters
    /// `running`; `ended_at` is set once, on entering `completed` or
    /// `archived`. Transition legality is the caller's concern.
    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: ExperimentStatus,
    ) -> Result<Self, sqlx::Error> {
        match status {
            ExperimentStatus::Running => {
                sqlx::query_as::<_, Experiment>(&format!(
                    r#"UPDATE experiments
                       SET status = $2,
                           started_at = COALESCE(started_at, CURRENT_TIMESTAMP),
                           updated_at = CURRENT_TIMESTAMP
                       WHERE id = $1
                       RETURNING {EXPERIMENT_COLUMNS}"#,
                ))
                .bind(id)
                .bind(status)
                .fetch_one(pool)
                .await
            }
            ExperimentStatus::Completed | ExperimentStatus::Archived => {
                sqlx::query_as::<_, Experiment>(&format!(
                    r#"UPDATE experiments
                       SET status = $2,
                           ended_at = COALESCE(ended_at, CURRENT_TIMESTAMP),
                           updated_at = CURRENT_TIMESTAMP
                       WHERE id = $1
                       RETURNING {EXPERIMENT_COLUMNS}"#,
                ))
                .bind(id)
                .bind(status)
                .fetch_one(pool)
                .await
            }
            _ => {
                sqlx::query_as::<_, Experiment>(&format!(
                    r#"UPDATE experiments
                       SET status = $2,
                           updated_at = CURRENT_TIMESTAMP
                       WHERE id = $1
                       RETURNING {EXPERIMENT_COLUMNS}"#,
                ))
                .bind(id)
                .bind(status)
                .fetch_one(pool)
                .await
            }
        }
    }
}
