use std::fs;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use caas::error::CaasError;
use caas::scheduler::job::{JobOutcome, JobRecord, JobState, Submission};
use caas::store::{FsStateStore, MemoryStateStore, StateStore};

fn record(jobid: u64) -> JobRecord {
    JobRecord::new(jobid, &Submission::new("alice", "reactors", "<simulation/>"))
}

fn stores() -> Vec<(tempfile::TempDir, Arc<dyn StateStore>)> {
    let fs_dir = tempfile::tempdir().unwrap();
    let fs_store: Arc<dyn StateStore> = Arc::new(FsStateStore::at_root(fs_dir.path()).unwrap());
    let mem_dir = tempfile::tempdir().unwrap();
    let mem_store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    vec![(fs_dir, fs_store), (mem_dir, mem_store)]
}

#[test]
fn test_put_then_find() {
    for (_dir, store) in stores() {
        store.put(&record(1)).unwrap();

        assert_eq!(store.locate(1).unwrap(), Some(JobState::Queued));
        let found = store.find(1).unwrap();
        assert_eq!(found.user, "alice");
        assert_eq!(found.state, JobState::Queued);
        assert_eq!(store.list(JobState::Queued).unwrap(), vec![1]);
        assert!(store.list(JobState::Running).unwrap().is_empty());
    }
}

#[test]
fn test_move_relocates_and_stamps() {
    for (_dir, store) in stores() {
        let original = record(7);
        store.put(&original).unwrap();

        let moved = store
            .move_job(7, JobState::Queued, JobState::Running, None)
            .unwrap();
        assert_eq!(moved.state, JobState::Running);
        assert!(moved.transitioned_at >= original.transitioned_at);

        assert!(!store.contains(7, JobState::Queued).unwrap());
        assert!(store.contains(7, JobState::Running).unwrap());

        let done = store
            .move_job(7, JobState::Running, JobState::Completed, Some(JobOutcome::failure("x")))
            .unwrap();
        assert_eq!(done.outcome.unwrap().error.as_deref(), Some("x"));
        assert_eq!(store.read(7, JobState::Completed).unwrap().state, JobState::Completed);
    }
}

#[test]
fn test_move_from_wrong_state_is_conflict() {
    for (_dir, store) in stores() {
        store.put(&record(3)).unwrap();

        let err = store
            .move_job(3, JobState::Running, JobState::Completed, None)
            .unwrap_err();
        match err {
            CaasError::Conflict {
                jobid,
                expected,
                actual,
            } => {
                assert_eq!(jobid, 3);
                assert_eq!(expected, JobState::Running);
                assert_eq!(actual, Some(JobState::Queued));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // Unchanged
        assert_eq!(store.locate(3).unwrap(), Some(JobState::Queued));
    }
}

#[test]
fn test_move_unknown_job_is_not_found() {
    for (_dir, store) in stores() {
        let err = store
            .move_job(99, JobState::Queued, JobState::Running, None)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.find(99).unwrap_err().is_not_found());
    }
}

#[test]
fn test_list_records_is_fifo() {
    for (_dir, store) in stores() {
        let now = Utc::now();
        let mut late = record(1);
        late.created_at = now;
        let mut early = record(2);
        early.created_at = now - ChronoDuration::seconds(10);
        let mut tie = record(3);
        tie.created_at = now;

        store.put(&late).unwrap();
        store.put(&tie).unwrap();
        store.put(&early).unwrap();

        let order: Vec<u64> = store
            .list_records(JobState::Queued)
            .unwrap()
            .iter()
            .map(|r| r.jobid)
            .collect();
        assert_eq!(order, vec![2, 1, 3]);
    }
}

#[test]
fn test_remove_if_respects_predicate() {
    for (_dir, store) in stores() {
        store.put(&record(5)).unwrap();
        store
            .move_job(5, JobState::Queued, JobState::Failed, None)
            .unwrap();

        let kept = store.remove_if(5, JobState::Failed, &|_| false).unwrap();
        assert!(kept.is_none());
        assert!(store.contains(5, JobState::Failed).unwrap());

        let removed = store.remove_if(5, JobState::Failed, &|_| true).unwrap();
        assert_eq!(removed.map(|r| r.jobid), Some(5));
        assert_eq!(store.locate(5).unwrap(), None);

        // Already gone
        assert!(store.remove_if(5, JobState::Failed, &|_| true).unwrap().is_none());
    }
}

#[test]
fn test_concurrent_moves_have_one_winner() {
    for (_dir, store) in stores() {
        store.put(&record(11)).unwrap();

        let handles: Vec<_> = [JobState::Running, JobState::Canceled]
            .into_iter()
            .cycle()
            .take(8)
            .map(|to| {
                let store = store.clone();
                std::thread::spawn(move || store.move_job(11, JobState::Queued, to, None))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for err in results.into_iter().filter_map(|r| r.err()) {
            assert!(err.is_conflict(), "loser should see a conflict, got {err:?}");
        }

        let present: usize = JobState::ALL
            .iter()
            .filter(|s| store.contains(11, **s).unwrap())
            .count();
        assert_eq!(present, 1);
    }
}

#[test]
fn test_reconcile_resolves_duplicate_by_latest_transition() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStateStore::at_root(dir.path()).unwrap();

    let mut queued = record(4);
    queued.transitioned_at = Utc::now() - ChronoDuration::seconds(30);
    store.put(&queued).unwrap();

    // Simulate a copy-then-delete move interrupted before the delete
    let mut running = queued.clone();
    running.state = JobState::Running;
    running.transitioned_at = Utc::now();
    fs::write(
        store.dir(JobState::Running).join("4.json"),
        serde_json::to_vec(&running).unwrap(),
    )
    .unwrap();

    let report = store.reconcile().unwrap();
    assert_eq!(report.duplicates_resolved, vec![4]);
    assert_eq!(report.max_jobid, Some(4));
    assert!(!store.contains(4, JobState::Queued).unwrap());
    assert!(store.contains(4, JobState::Running).unwrap());
}

#[test]
fn test_reconcile_repairs_state_field_and_removes_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStateStore::at_root(dir.path()).unwrap();

    // Record relocated but not rewritten: file says queued, lives in failed
    let stale = record(8);
    fs::write(
        store.dir(JobState::Failed).join("8.json"),
        serde_json::to_vec(&stale).unwrap(),
    )
    .unwrap();
    fs::write(store.dir(JobState::Queued).join(".9.abc.tmp"), b"partial").unwrap();

    let report = store.reconcile().unwrap();
    assert_eq!(report.temp_files_removed, 1);
    assert_eq!(report.records_repaired, vec![8]);

    let raw: JobRecord =
        serde_json::from_slice(&fs::read(store.dir(JobState::Failed).join("8.json")).unwrap())
            .unwrap();
    assert_eq!(raw.state, JobState::Failed);
    assert!(!store.dir(JobState::Queued).join(".9.abc.tmp").exists());
}

#[test]
fn test_reconcile_reports_corrupt_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsStateStore::at_root(dir.path()).unwrap();
    fs::write(store.dir(JobState::Completed).join("2.json"), b"{not json").unwrap();

    let err = store.reconcile().unwrap_err();
    assert!(matches!(err, CaasError::StoreCorruption { .. }));
}
