//! Job Store Integration Tests
//!
//! Persistence layout, listing, deletion and the append-only event log.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use fhirpipe::config::PipelineConfig;
use fhirpipe::core::{JobLock, JobStore};
use fhirpipe::domain::{EventType, InputType, JobEvent, PipelineJob, StepName, StepStatus};
use fhirpipe::error::ErrorCategory;

fn new_job(source: &str) -> PipelineJob {
    PipelineJob::new(
        source.to_string(),
        InputType::Local,
        &[StepName::LocalImport, StepName::Validate],
        PipelineConfig::default(),
    )
}

#[tokio::test]
async fn test_job_directory_layout() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let job = new_job("/data/export");

    store.create(&job).await.unwrap();
    store
        .append_event(&JobEvent::new(job.id, None, EventType::JobCreated, "created".to_string()))
        .unwrap();

    let dir = store.job_dir(job.id);
    assert!(dir.join("state.json").is_file());
    assert!(dir.join("config.json").is_file());
    assert!(dir.join("events.jsonl").is_file());
    assert_eq!(
        store.step_output_path(job.id, StepName::Validate),
        dir.join("validation-report.json")
    );
    assert_eq!(
        store.step_output_dir(job.id, StepName::LocalImport),
        Some(dir.join("import"))
    );
}

#[tokio::test]
async fn test_state_survives_reload() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let mut job = new_job("/data/export");
    store.create(&job).await.unwrap();

    let step = job.step_mut(StepName::LocalImport).unwrap();
    step.transition(StepStatus::Running).unwrap();
    step.transition(StepStatus::Completed).unwrap();
    job.current_step = Some(StepName::LocalImport);
    store.save(&job).await.unwrap();

    let loaded = store.load(&job.id.to_string()).await.unwrap();
    assert_eq!(loaded.steps, job.steps);
    assert_eq!(loaded.current_step, Some(StepName::LocalImport));
    assert_eq!(loaded.config, job.config);
}

#[tokio::test]
async fn test_list_is_newest_first_and_skips_broken_jobs() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());

    let older = new_job("/data/older");
    store.create(&older).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = new_job("/data/newer");
    store.create(&newer).await.unwrap();

    let broken = new_job("/data/broken");
    store.create(&broken).await.unwrap();
    std::fs::write(store.state_path(broken.id), "{ not json").unwrap();

    // Unrelated directories are ignored
    std::fs::create_dir_all(temp.path().join("scratch")).unwrap();

    let jobs = store.list().await.unwrap();
    let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let job = new_job("/data/export");
    store.create(&job).await.unwrap();

    store.delete(&job.id.to_string(), false).await.unwrap();
    assert!(!store.job_dir(job.id).exists());

    let err = store.delete(&job.id.to_string(), false).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::State);
}

#[tokio::test]
async fn test_force_delete_ignores_lock() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let job = new_job("/data/export");
    store.create(&job).await.unwrap();

    let lock = store.lock(job.id, Duration::from_secs(3600)).unwrap();
    assert!(JobLock::is_locked(&store.job_dir(job.id)));
    assert!(store.delete(&job.id.to_string(), false).await.is_err());

    store.delete(&job.id.to_string(), true).await.unwrap();
    assert!(!store.job_dir(job.id).exists());
    drop(lock);
}

#[tokio::test]
async fn test_lock_records_holder() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let job = new_job("/data/export");
    store.create(&job).await.unwrap();

    let dir = store.job_dir(job.id);
    {
        let _lock = store.lock(job.id, Duration::from_secs(3600)).unwrap();
        let holder = JobLock::holder(&dir).unwrap();
        assert_eq!(holder.pid, std::process::id());
    }
    assert!(JobLock::holder(&dir).is_none());
}

#[tokio::test]
async fn test_old_lock_of_a_live_holder_is_not_taken_over() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let job = new_job("/data/export");
    store.create(&job).await.unwrap();

    let dir = store.job_dir(job.id);
    let held = store.lock(job.id, Duration::from_secs(3600)).unwrap();
    let two_hours_ago = filetime::FileTime::from_unix_time(chrono::Utc::now().timestamp() - 7200, 0);
    filetime::set_file_mtime(dir.join("job.lock"), two_hours_ago).unwrap();

    let err = store.lock(job.id, Duration::from_secs(3600)).unwrap_err();
    assert_eq!(err.category, ErrorCategory::State);
    assert!(err.message.contains("locked"));
    assert_eq!(JobLock::holder(&dir).as_ref(), Some(held.info()));

    drop(held);
    assert!(!JobLock::is_locked(&dir));
}

#[tokio::test]
async fn test_snapshot_omits_secrets() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let mut config = PipelineConfig::default();
    config.services.torch.password = Some("s3cret".to_string());
    let job = PipelineJob::new(
        "/data/crtdl.json".to_string(),
        InputType::Crtdl,
        &[StepName::TorchImport],
        config,
    );
    store.create(&job).await.unwrap();

    let snapshot = std::fs::read_to_string(store.config_path(job.id)).unwrap();
    assert!(!snapshot.contains("s3cret"));

    let loaded = store.load(&job.id.to_string()).await.unwrap();
    assert!(loaded.config.services.torch.password.is_none());
}

#[tokio::test]
async fn test_reset_step_output_removes_checkpoint() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let job = new_job("/data/export");
    store.create(&job).await.unwrap();

    let output = store.step_output_path(job.id, StepName::LocalImport);
    let checkpoint = store.step_checkpoint_path(job.id, StepName::LocalImport);
    std::fs::create_dir_all(&output).unwrap();
    std::fs::write(output.join("Patient.ndjson"), "{}\n").unwrap();
    std::fs::write(&checkpoint, "{}").unwrap();

    store.reset_step_output(job.id, StepName::LocalImport).await.unwrap();
    assert!(!output.exists());
    assert!(!checkpoint.exists());
}

#[test]
fn test_concurrent_appends_keep_lines_intact() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JobStore::new(temp.path()));
    let job = new_job("/data/export");
    std::fs::create_dir_all(store.job_dir(job.id)).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let store = store.clone();
            let job_id = job.id;
            std::thread::spawn(move || {
                for n in 0..50 {
                    let event = JobEvent::new(
                        job_id,
                        Some(StepName::LocalImport),
                        EventType::StepRetrying,
                        format!("writer {} event {} {}", writer, n, "x".repeat(512)),
                    )
                    .with_attempt(n);
                    store.append_event(&event).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let content = std::fs::read_to_string(store.events_path(job.id)).unwrap();
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 200);
    for line in lines {
        let event: JobEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.job_id, job.id);
    }
}

#[tokio::test]
async fn test_reading_events_skips_garbage_lines() {
    let temp = TempDir::new().unwrap();
    let store = JobStore::new(temp.path());
    let job = new_job("/data/export");
    store.create(&job).await.unwrap();

    store
        .append_event(&JobEvent::new(job.id, None, EventType::JobCreated, "created".to_string()))
        .unwrap();
    let path = store.events_path(job.id);
    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("\n{ truncated\n");
    std::fs::write(&path, content).unwrap();
    store
        .append_event(&JobEvent::new(job.id, None, EventType::JobCompleted, "done".to_string()))
        .unwrap();

    let events = store.read_events(&job.id.to_string()).await.unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::JobCreated, EventType::JobCompleted]);
}
