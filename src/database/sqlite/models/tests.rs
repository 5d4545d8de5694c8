use chrono::Utc;

use super::*;

fn job(total: i64, processed: i64, failed: i64) -> MigrationJob {
    MigrationJob {
        id: 1,
        knowledge_source_id: 7,
        source_provider: ProviderKind::LocalBge,
        source_model: "bge-base-en-v1.5".to_string(),
        target_provider: ProviderKind::OpenAi,
        target_model: "text-embedding-3-large".to_string(),
        total_chunks: total,
        processed_chunks: processed,
        failed_chunks: failed,
        status: MigrationStatus::InProgress,
        batch_size: 10,
        error_message: None,
        started_at: Some(Utc::now().naive_utc()),
        completed_at: None,
        cleaned_up_at: None,
        created_date: Utc::now().naive_utc(),
    }
}

#[test]
fn migration_status_display() {
    assert_eq!(MigrationStatus::Pending.to_string(), "Pending");
    assert_eq!(MigrationStatus::InProgress.to_string(), "In progress");
    assert_eq!(MigrationStatus::Completed.to_string(), "Completed");
    assert_eq!(MigrationStatus::Failed.to_string(), "Failed");
    assert_eq!(MigrationStatus::InProgress.as_str(), "in_progress");
}

#[test]
fn only_pending_and_running_jobs_are_active() {
    assert!(MigrationStatus::Pending.is_active());
    assert!(MigrationStatus::InProgress.is_active());
    assert!(!MigrationStatus::Completed.is_active());
    assert!(!MigrationStatus::Failed.is_active());
}

#[test]
fn migration_progress() {
    let halfway = job(40, 15, 5);
    assert_eq!(halfway.progress_percentage(), 50.0);
    assert!(!halfway.is_finished());

    let done = job(40, 38, 2);
    assert!(done.is_finished());

    let empty = job(0, 0, 0);
    assert_eq!(empty.progress_percentage(), 100.0);
    assert!(empty.is_finished());
}

#[test]
fn job_specs() {
    let job = job(1, 0, 0);
    assert_eq!(
        job.source_spec(),
        ProviderSpec::new(ProviderKind::LocalBge, "bge-base-en-v1.5")
    );
    assert_eq!(job.target_spec().to_string(), "openai/text-embedding-3-large");
}
