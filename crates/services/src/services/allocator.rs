//! Variant allocation: deterministic hashing, weighted bucket selection,
//! and idempotent assignment persistence.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use db::{
    models::{
        assignment::Assignment,
        experiment::{Experiment, ExperimentStatus},
        variant::Variant,
    },
    percent::Percent,
};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Size of the bucket space: hundredths of a percent across [0%, 100%).
const BUCKET_SPACE: i64 = 10_000;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("experiment {0} is absent or not running")]
    ExperimentNotEligible(Uuid),
    #[error("experiment {0} has no active variants")]
    NoActiveVariants(Uuid),
    #[error("visitor bucket is outside the experiment's allocated traffic")]
    NoVariantForBucket,
    #[error("assignment storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Map `(experiment_id, visitor_id)` onto a bucket in `[0, 10_000)`.
///
/// SHA-256 over the UTF-8 concatenation of the two identifiers, first
/// 8 bytes taken big-endian, spread over the bucket space with a 128-bit
/// multiply so every input bit contributes. Stable across processes and
/// releases; the same pair always lands in the same bucket, which is what
/// lets an assignment be re-derived if its row were ever lost.
pub fn visitor_bucket(experiment_id: Uuid, visitor_id: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(visitor_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);

    ((u128::from(hash) * BUCKET_SPACE as u128) >> 64) as i64
}

/// Pick the variant whose cumulative weight range contains `bucket`.
///
/// Variants are re-ordered by id so the partition never depends on how the
/// caller fetched the slice. Cumulative boundaries are scaled by the
/// experiment's `traffic_allocation`, so an experiment admitting 50% of
/// traffic with variants weighted 70/30 partitions [0,3500) and [3500,5000);
/// buckets past the last boundary fall outside the experiment.
pub fn select_variant<'a>(
    variants: &'a [Variant],
    traffic_allocation: Percent,
    bucket: i64,
) -> Option<&'a Variant> {
    let mut ordered: Vec<&Variant> = variants.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    let admitted = traffic_allocation.hundredths();
    let mut cumulative: i64 = 0;
    for variant in ordered {
        cumulative = (cumulative + variant.traffic_percentage.hundredths()).min(BUCKET_SPACE);
        let boundary = cumulative * admitted / BUCKET_SPACE;
        if bucket < boundary {
            return Some(variant);
        }
    }
    None
}

pub struct AllocatorService;

impl AllocatorService {
    /// Allocate `visitor_id` into a variant of `experiment_id`, or return
    /// the existing assignment unchanged.
    ///
    /// The existence check and the insert are not atomic together; the
    /// UNIQUE constraint on `(experiment_id, visitor_id)` is. A concurrent
    /// first-time caller that loses the insert race reselects and returns
    /// the winner's row. The insert is retried once with backoff before a
    /// storage error is surfaced.
    pub async fn assign(
        pool: &SqlitePool,
        experiment_id: Uuid,
        visitor_id: &str,
    ) -> Result<Assignment, AllocationError> {
        let experiment = Experiment::find_by_id(pool, experiment_id)
            .await?
            .ok_or(AllocationError::ExperimentNotEligible(experiment_id))?;
        if experiment.status != ExperimentStatus::Running {
            return Err(AllocationError::ExperimentNotEligible(experiment_id));
        }

        if let Some(existing) =
            Assignment::find_by_experiment_and_visitor(pool, experiment_id, visitor_id).await?
        {
            debug!(
                experiment_id = %experiment_id,
                visitor_id = %visitor_id,
                variant_id = %existing.variant_id,
                "returning sticky assignment"
            );
            return Ok(existing);
        }

        let variants = Variant::find_active_by_experiment_id(pool, experiment_id).await?;
        if variants.is_empty() {
            return Err(AllocationError::NoActiveVariants(experiment_id));
        }

        let bucket = visitor_bucket(experiment_id, visitor_id);
        let variant = select_variant(&variants, experiment.traffic_allocation, bucket)
            .ok_or(AllocationError::NoVariantForBucket)?;

        let assignment_id = Uuid::new_v4();
        let variant_id = variant.id;
        let insert = || async move {
            Assignment::try_insert(pool, assignment_id, experiment_id, visitor_id, variant_id)
                .await
        };
        let inserted = insert
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(50))
                    .with_max_times(1),
            )
            .notify(|err: &sqlx::Error, dur: Duration| {
                warn!(
                    experiment_id = %experiment_id,
                    error = %err,
                    retry_in = ?dur,
                    "assignment insert failed, retrying"
                );
            })
            .await?;

        match inserted {
            Some(assignment) => {
                info!(
                    experiment_id = %experiment_id,
                    visitor_id = %visitor_id,
                    variant_id = %variant_id,
                    bucket = bucket,
                    "created assignment"
                );
                Ok(assignment)
            }
            // Lost the insert race; the winner's row is authoritative.
            None => Assignment::find_by_experiment_and_visitor(pool, experiment_id, visitor_id)
                .await?
                .ok_or(AllocationError::Storage(sqlx::Error::RowNotFound)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use db::{
        DBService,
        models::{
            experiment::{Algorithm, CreateExperiment},
            project::{CreateProject, Project},
            variant::CreateVariant,
        },
    };

    use super::*;

    fn synthetic_variant(id: Uuid, weight_hundredths: i64) -> Variant {
        Variant {
            id,
            experiment_id: Uuid::nil(),
            name: format!("variant-{id}"),
            is_control: false,
            is_active: true,
            traffic_percentage: Percent::from_hundredths(weight_hundredths),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn test_db() -> (tempfile::TempDir, DBService) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let db = DBService::new(&url).await.unwrap();
        (dir, db)
    }

    async fn seed_running_experiment(
        pool: &SqlitePool,
        traffic_allocation: Percent,
        weights: &[i64],
    ) -> (Uuid, Vec<Uuid>) {
        let project = Project::create(
            pool,
            &CreateProject {
                name: "Acme".to_string(),
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();

        let experiment = Experiment::create(
            pool,
            project.id,
            &CreateExperiment {
                name: "checkout-cta".to_string(),
                description: None,
                algorithm: Some(Algorithm::Uniform),
                traffic_allocation: Some(traffic_allocation),
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();

        let mut variant_ids = Vec::new();
        for (i, weight) in weights.iter().enumerate() {
            let variant = Variant::create(
                pool,
                experiment.id,
                &CreateVariant {
                    name: format!("variant-{i}"),
                    is_control: Some(i == 0),
                    traffic_percentage: Percent::from_hundredths(*weight),
                },
                Uuid::new_v4(),
            )
            .await
            .unwrap();
            variant_ids.push(variant.id);
        }

        Experiment::update_status(pool, experiment.id, ExperimentStatus::Running)
            .await
            .unwrap();

        (experiment.id, variant_ids)
    }

    #[test]
    fn bucket_is_deterministic_and_in_range() {
        let experiment_id = Uuid::new_v4();
        for i in 0..1000 {
            let visitor = format!("visitor-{i}");
            let first = visitor_bucket(experiment_id, &visitor);
            let second = visitor_bucket(experiment_id, &visitor);
            assert_eq!(first, second);
            assert!((0..BUCKET_SPACE).contains(&first));
        }
    }

    #[test]
    fn selection_ignores_caller_ordering() {
        let a = synthetic_variant(Uuid::new_v4(), 7000);
        let b = synthetic_variant(Uuid::new_v4(), 3000);
        let forward = vec![a.clone(), b.clone()];
        let reverse = vec![b, a];
        for bucket in [0, 1234, 4999, 5000, 6999, 7000, 9999] {
            let x = select_variant(&forward, Percent::FULL, bucket).map(|v| v.id);
            let y = select_variant(&reverse, Percent::FULL, bucket).map(|v| v.id);
            assert_eq!(x, y);
        }
    }

    #[test]
    fn weight_conformance_70_30() {
        let variants = vec![
            synthetic_variant(Uuid::new_v4(), 7000),
            synthetic_variant(Uuid::new_v4(), 3000),
        ];
        let experiment_id = Uuid::nil();
        let total = 100_000;
        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for i in 0..total {
            let bucket = visitor_bucket(experiment_id, &format!("visitor-{i}"));
            let chosen = select_variant(&variants, Percent::FULL, bucket).unwrap();
            *counts.entry(chosen.id).or_default() += 1;
        }
        for variant in &variants {
            let expected = variant.traffic_percentage.hundredths() as f64 / BUCKET_SPACE as f64;
            let observed = counts[&variant.id] as f64 / total as f64;
            assert!(
                (observed - expected).abs() < 0.015,
                "variant at {expected} observed {observed}"
            );
        }
    }

    #[test]
    fn partial_allocation_leaves_remainder_unassigned() {
        let variants = vec![
            synthetic_variant(Uuid::new_v4(), 2500),
            synthetic_variant(Uuid::new_v4(), 1500),
        ];
        let experiment_id = Uuid::nil();
        let total = 100_000;
        let mut unassigned = 0usize;
        for i in 0..total {
            let bucket = visitor_bucket(experiment_id, &format!("visitor-{i}"));
            if select_variant(&variants, Percent::FULL, bucket).is_none() {
                unassigned += 1;
            }
        }
        let observed = unassigned as f64 / total as f64;
        assert!(
            (observed - 0.60).abs() < 0.015,
            "expected ~0.60 unassigned, observed {observed}"
        );
    }

    #[test]
    fn traffic_allocation_scales_the_partition() {
        let variant = synthetic_variant(Uuid::new_v4(), 10_000);
        let variants = vec![variant];
        // Half the population admitted: boundary sits at 5000.
        assert!(select_variant(&variants, Percent::from_hundredths(5000), 4999).is_some());
        assert!(select_variant(&variants, Percent::from_hundredths(5000), 5000).is_none());
        // Full allocation is the identity partition.
        assert!(select_variant(&variants, Percent::FULL, 9999).is_some());
        // Zero allocation admits nobody.
        assert!(select_variant(&variants, Percent::ZERO, 0).is_none());
    }

    #[test]
    fn overweight_configuration_is_capped_at_full() {
        // Sums over 100% must not push boundaries past the bucket space.
        let variants = vec![
            synthetic_variant(Uuid::new_v4(), 9000),
            synthetic_variant(Uuid::new_v4(), 9000),
        ];
        assert!(select_variant(&variants, Percent::FULL, 9999).is_some());
    }

    #[tokio::test]
    async fn assign_is_sticky_across_variant_changes() {
        let (_dir, db) = test_db().await;
        let (experiment_id, variant_ids) =
            seed_running_experiment(&db.pool, Percent::FULL, &[5000, 5000]).await;

        let first = AllocatorService::assign(&db.pool, experiment_id, "visitor-123")
            .await
            .unwrap();
        let second = AllocatorService::assign(&db.pool, experiment_id, "visitor-123")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.variant_id, second.variant_id);
        assert!(variant_ids.contains(&first.variant_id));

        // Deactivating the assigned variant must not disturb the record.
        Variant::set_active(&db.pool, first.variant_id, false)
            .await
            .unwrap();
        let third = AllocatorService::assign(&db.pool, experiment_id, "visitor-123")
            .await
            .unwrap();
        assert_eq!(first.variant_id, third.variant_id);
    }

    #[tokio::test]
    async fn different_visitors_are_stable_independently() {
        let (_dir, db) = test_db().await;
        let (experiment_id, _) =
            seed_running_experiment(&db.pool, Percent::FULL, &[5000, 5000]).await;

        let a1 = AllocatorService::assign(&db.pool, experiment_id, "visitor-a")
            .await
            .unwrap();
        let a2 = AllocatorService::assign(&db.pool, experiment_id, "visitor-a")
            .await
            .unwrap();
        let b1 = AllocatorService::assign(&db.pool, experiment_id, "visitor-b")
            .await
            .unwrap();
        assert_eq!(a1.variant_id, a2.variant_id);
        assert_eq!(b1.visitor_id, "visitor-b");
    }

    #[tokio::test]
    async fn absent_or_not_running_experiment_is_not_eligible() {
        let (_dir, db) = test_db().await;

        let missing = AllocatorService::assign(&db.pool, Uuid::new_v4(), "visitor-1").await;
        assert!(matches!(
            missing,
            Err(AllocationError::ExperimentNotEligible(_))
        ));

        let project = Project::create(
            &db.pool,
            &CreateProject {
                name: "Acme".to_string(),
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        let draft = Experiment::create(
            &db.pool,
            project.id,
            &CreateExperiment {
                name: "dormant".to_string(),
                description: None,
                algorithm: None,
                traffic_allocation: None,
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();

        let result = AllocatorService::assign(&db.pool, draft.id, "visitor-1").await;
        assert!(matches!(
            result,
            Err(AllocationError::ExperimentNotEligible(_))
        ));
    }

    #[tokio::test]
    async fn experiment_without_active_variants_fails() {
        let (_dir, db) = test_db().await;
        let (experiment_id, variant_ids) =
            seed_running_experiment(&db.pool, Percent::FULL, &[10_000]).await;

        Variant::set_active(&db.pool, variant_ids[0], false)
            .await
            .unwrap();

        let result = AllocatorService::assign(&db.pool, experiment_id, "visitor-1").await;
        assert!(matches!(result, Err(AllocationError::NoActiveVariants(_))));
    }

    #[tokio::test]
    async fn low_weight_variant_rejects_out_of_bucket_visitors() {
        let (_dir, db) = test_db().await;
        let (experiment_id, variant_ids) =
            seed_running_experiment(&db.pool, Percent::FULL, &[1000]).await;

        let mut inside = None;
        let mut outside = None;
        for i in 0..10_000 {
            let visitor = format!("visitor-{i}");
            let bucket = visitor_bucket(experiment_id, &visitor);
            if bucket < 1000 && inside.is_none() {
                inside = Some(visitor);
            } else if bucket >= 1000 && outside.is_none() {
                outside = Some(visitor);
            }
            if inside.is_some() && outside.is_some() {
                break;
            }
        }
        let inside = inside.unwrap();
        let outside = outside.unwrap();

        let assigned = AllocatorService::assign(&db.pool, experiment_id, &inside)
            .await
            .unwrap();
        assert_eq!(assigned.variant_id, variant_ids[0]);

        let rejected = AllocatorService::assign(&db.pool, experiment_id, &outside).await;
        assert!(matches!(rejected, Err(AllocationError::NoVariantForBucket)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_assigns_converge_on_one_row() {
        let (_dir, db) = test_db().await;
        let (experiment_id, _) =
            seed_running_experiment(&db.pool, Percent::FULL, &[5000, 5000]).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = db.pool.clone();
            handles.push(tokio::spawn(async move {
                AllocatorService::assign(&pool, experiment_id, "visitor-race").await
            }));
        }

        let mut variant_ids = Vec::new();
        for handle in handles {
            let assignment = handle.await.unwrap().unwrap();
            variant_ids.push(assignment.variant_id);
        }
        let first = variant_ids[0];
        assert!(variant_ids.iter().all(|id| *id == first));

        let rows = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM assignments WHERE experiment_id = $1 AND visitor_id = $2",
        )
        .bind(experiment_id)
        .bind("visitor-race")
        .fetch_one(&db.pool)
        .await
        .unwrap();
        assert_eq!(rows, 1);
    }
}
