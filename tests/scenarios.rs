// tests/scenarios.rs

//! End-to-end job scenarios driven through the manager.

mod common;

use common::{CountingBuilder, TestDaemon, published_index, stage_upload, write_archive, write_manifest};
use ferryd::delta::DeltaError;
use ferryd::diff::{DiffKind, ResultBody};
use ferryd::jobs::{Job, JobKind, JobStatus};
use ferryd::repo::{self, Repository};
use ferryd::transit::listener;
use std::fs;

const FOO_1: &str = "foo-1.0-1-1-x86_64.eopkg";
const FOO_2: &str = "foo-1.1-2-1-x86_64.eopkg";
const FOO_3: &str = "foo-1.2-3-1-x86_64.eopkg";
const BAR_1: &str = "bar-0.9-1-1-x86_64.eopkg";

#[test]
fn test_create_repository() {
    let daemon = TestDaemon::new();
    let id = daemon.manager.create_repo("stable").unwrap();

    let queued = daemon.manager.get_job(id).unwrap();
    assert_eq!(queued.status, JobStatus::New);
    assert!(queued.created_at.is_some());

    daemon.run();
    let job = daemon.manager.get_job(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.finished_at.is_some());

    assert!(daemon.repo_dir("stable").is_dir());
    let repos = daemon.manager.repositories().unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].name, "stable");

    let again = daemon.run_job(|m| m.create_repo("stable"));
    assert_eq!(again.status, JobStatus::Failed);
    assert!(again.message.unwrap().contains("already exists"));
}

#[test]
fn test_delta_between_releases() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1, FOO_2]);

    let job = daemon.run_job(|m| m.delta("stable"));
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.message);
    match job.result.map(|r| r.body) {
        Some(ResultBody::Jobs { ids }) => assert_eq!(ids.len(), 1),
        other => panic!("unexpected result {:?}", other),
    }

    let delta = daemon
        .entry("foo-1-2-1-x86_64.delta.eopkg")
        .expect("delta in pool");
    assert_eq!(delta.archive.from_release, Some(1));
    assert_eq!(delta.archive.release, 2);
    assert_eq!(delta.refcount, 1);

    let ctx = daemon.manager.context();
    let deltas = ctx
        .db
        .transaction(|tx| {
            let repo = Repository::get(tx, "stable")?;
            ctx.pool.linked_deltas(tx, repo.id, "foo")
        })
        .unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].id, delta.id);
    assert!(
        daemon
            .repo_dir("stable")
            .join("f/foo/foo-1-2-1-x86_64.delta.eopkg")
            .is_file()
    );

    // Already linked: nothing is rebuilt.
    daemon.run_job(|m| m.delta("stable"));
    assert_eq!(daemon.builder.calls(), 1);
}

#[test]
fn test_freeze_blocks_writes() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1]);
    let before = published_index(&daemon.repo_dir("stable"));

    let frozen = daemon.run_job(|m| m.freeze("stable"));
    assert_eq!(frozen.status, JobStatus::Completed);
    assert!(repo::is_frozen(&daemon.config, "stable"));

    let index = daemon.run_job(|m| m.index("stable"));
    assert_eq!(index.status, JobStatus::Failed);
    assert!(index.message.unwrap().contains("frozen"));

    let dir = daemon.incoming("stable");
    write_archive(&dir, FOO_2);
    let import = daemon.run_job(|m| m.import("stable", &dir));
    assert_eq!(import.status, JobStatus::Failed);
    assert_eq!(daemon.linked_names("stable"), vec![FOO_1.to_string()]);
    assert_eq!(published_index(&daemon.repo_dir("stable")), before);

    let thawed = daemon.run_job(|m| m.unfreeze("stable"));
    assert_eq!(thawed.status, JobStatus::Completed);
    let import = daemon.run_job(|m| m.import("stable", &dir));
    assert_eq!(import.status, JobStatus::Completed, "{:?}", import.message);
    assert_eq!(daemon.linked("stable").len(), 2);
}

#[test]
fn test_transit_rejects_bad_checksum() {
    let daemon = TestDaemon::new();
    daemon.create_repo("unstable");
    let transit = daemon.config.transit_dir();

    let (path, _) = stage_upload(&transit, FOO_1);
    let manifest = write_manifest(
        &transit,
        "upload.tram",
        "unstable",
        &[(path, "0".repeat(64))],
    );

    let ctx = daemon.manager.context();
    let rejected = listener::submit(&ctx, &manifest);
    assert!(matches!(rejected, Err(ferryd::Error::ChecksumMismatch { .. })));
    assert!(daemon.manager.active_jobs().unwrap().is_empty());

    // A job queued anyway re-verifies before touching the pool.
    let job = daemon.run_job(|m| {
        m.context().jobs.push(
            Job::new(JobKind::TransitProcess).with_sources([manifest.to_string_lossy().into_owned()]),
        )
    });
    assert_eq!(job.status, JobStatus::Failed);
    assert!(daemon.linked("unstable").is_empty());
    assert!(daemon.entry(FOO_1).is_none());
    assert!(manifest.exists());
}

#[test]
fn test_transit_links_into_instant_repos() {
    let daemon = TestDaemon::new();
    daemon.create_repo("unstable");
    daemon.create_repo("mirror");
    daemon.create_repo("archive");
    let enabled = daemon.run_job(|m| m.set_instant_transit("mirror", true));
    assert_eq!(enabled.status, JobStatus::Completed);

    let transit = daemon.config.transit_dir();
    let upload = stage_upload(&transit, FOO_1);
    let payload = transit.join(FOO_1);
    let manifest = write_manifest(&transit, "upload.tram", "unstable", &[upload]);

    let ctx = daemon.manager.context();
    let id = listener::submit(&ctx, &manifest).unwrap().expect("queued");
    assert_eq!(listener::submit(&ctx, &manifest).unwrap(), None);

    daemon.run();
    let job = daemon.manager.get_job(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.message);

    assert_eq!(daemon.linked_names("unstable"), vec![FOO_1.to_string()]);
    assert_eq!(daemon.linked_names("mirror"), vec![FOO_1.to_string()]);
    assert!(daemon.linked("archive").is_empty());
    assert_eq!(daemon.entry(FOO_1).unwrap().refcount, 2);
    assert!(!manifest.exists());
    assert!(!payload.exists());
    assert!(daemon.repo_dir("unstable").join("eopkg-index.xml").is_file());

    let follow_ups: Vec<_> = daemon
        .manager
        .completed_jobs()
        .unwrap()
        .into_iter()
        .filter(|j| j.kind == JobKind::DeltaIndex)
        .collect();
    assert_eq!(follow_ups.len(), 2);
    assert!(follow_ups.iter().all(|j| j.sources == vec!["foo".to_string()]));
}

#[test]
fn test_refcount_follows_repositories() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1, BAR_1]);
    let cloned = daemon.run_job(|m| m.clone_repo("stable", "snapshot", 0));
    assert_eq!(cloned.status, JobStatus::Completed, "{:?}", cloned.message);

    let entry = daemon.entry(FOO_1).unwrap();
    assert_eq!(entry.refcount, 2);
    let pool_file = daemon.manager.context().pool.entry_path(&entry.archive);
    assert!(pool_file.is_file());

    daemon.run_job(|m| m.delete_repo("stable"));
    assert_eq!(daemon.entry(FOO_1).unwrap().refcount, 1);
    assert!(!daemon.repo_dir("stable").exists());

    daemon.run_job(|m| m.delete_repo("snapshot"));
    assert!(daemon.entry(FOO_1).is_none());
    assert!(!pool_file.exists());
}

#[test]
fn test_rolled_back_delete_keeps_files() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1]);
    let ctx = daemon.manager.context();
    let entry = daemon.entry(FOO_1).unwrap();
    let pool_file = ctx.pool.entry_path(&entry.archive);
    let repo_file = ctx.pool.repo_path("stable", &entry.archive);

    // Fail the last statement of the deletion, after every link is dropped
    ctx.db
        .transaction(|tx| {
            tx.execute_batch(
                "CREATE TRIGGER keep_repositories BEFORE DELETE ON repositories
                 BEGIN SELECT RAISE(ABORT, 'repository is pinned'); END;",
            )?;
            Ok(())
        })
        .unwrap();

    let job = daemon.run_job(|m| m.delete_repo("stable"));
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(daemon.manager.repositories().unwrap().len(), 1);
    assert_eq!(daemon.entry(FOO_1).unwrap().refcount, 1);
    assert!(pool_file.is_file());
    assert!(repo_file.is_file());
    assert_eq!(daemon.linked_names("stable"), vec![FOO_1.to_string()]);
}

#[test]
fn test_delete_completes_when_tree_cannot_be_removed() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1]);
    let entry = daemon.entry(FOO_1).unwrap();
    let pool_file = daemon.manager.context().pool.entry_path(&entry.archive);

    let deltas = daemon.config.delta_dir("stable");
    if deltas.is_dir() {
        fs::remove_dir_all(&deltas).unwrap();
    }
    fs::create_dir_all(deltas.parent().unwrap()).unwrap();
    fs::write(&deltas, b"not a directory").unwrap();

    let job = daemon.run_job(|m| m.delete_repo("stable"));
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.message);
    assert!(daemon.manager.repositories().unwrap().is_empty());
    assert!(daemon.entry(FOO_1).is_none());
    assert!(!pool_file.exists());
    assert!(!daemon.repo_dir("stable").exists());
}

#[test]
fn test_interrupted_job_runs_after_restart() {
    let daemon = TestDaemon::new();
    let id = daemon.manager.create_repo("stable").unwrap();
    let claimed = daemon.manager.context().jobs.claim().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Running);

    let daemon = daemon.reopen();
    assert_eq!(daemon.manager.get_job(id).unwrap().status, JobStatus::New);
    daemon.run();
    assert_eq!(daemon.manager.get_job(id).unwrap().status, JobStatus::Completed);
}

#[test]
fn test_pointless_delta_is_remembered() {
    let daemon = TestDaemon::with_builder(CountingBuilder::failing(DeltaError::Pointless {
        delta_size: 95,
        new_size: 100,
    }));
    daemon.import("stable", &[FOO_1, FOO_2]);

    for _ in 0..2 {
        let job = daemon.run_job(|m| m.delta("stable"));
        assert_eq!(job.status, JobStatus::Completed);
    }
    assert_eq!(daemon.builder.calls(), 1);
    assert!(daemon.entry("foo-1-2-1-x86_64.delta.eopkg").is_none());

    // The memo is global: another repository holding the same pair skips it too.
    daemon.run_job(|m| m.clone_repo("stable", "testing", 0));
    daemon.run_job(|m| m.delta("testing"));
    assert_eq!(daemon.builder.calls(), 1);
}

#[test]
fn test_failed_builder_fails_job() {
    let daemon = TestDaemon::with_builder(CountingBuilder::failing(DeltaError::Failed(
        "disk full".to_string(),
    )));
    daemon.import("stable", &[FOO_1, FOO_2]);

    daemon.run_job(|m| m.delta("stable"));
    let failed = daemon.manager.failed_jobs().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, JobKind::DeltaPackage);
    assert!(failed[0].message.as_deref().unwrap().contains("disk full"));
}

#[test]
fn test_failed_index_keeps_published_files() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1]);
    let repo_dir = daemon.repo_dir("stable");
    let before = published_index(&repo_dir);
    assert_eq!(before.len(), 9);

    let dir = daemon.incoming("stable");
    write_archive(&dir, FOO_2);
    daemon.run_job(|m| m.bulk_add("stable", &[dir.join(FOO_2).as_path()]));

    let blocker = repo_dir.join("eopkg-index.xml.xz.new");
    fs::create_dir(&blocker).unwrap();
    let job = daemon.run_job(|m| m.index("stable"));
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.message.unwrap().contains("Index publication failed"));

    fs::remove_dir(&blocker).unwrap();
    assert_eq!(published_index(&repo_dir), before);
    let leftovers: Vec<_> = fs::read_dir(&repo_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".new"))
        .collect();
    assert!(leftovers.is_empty());

    let job = daemon.run_job(|m| m.index("stable"));
    assert_eq!(job.status, JobStatus::Completed);
    assert_ne!(published_index(&repo_dir), before);
}

#[test]
fn test_clone_pull_sync_and_trim() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1, FOO_2, FOO_3, BAR_1]);

    let cloned = daemon.run_job(|m| m.clone_repo("stable", "snapshot", 2));
    assert_eq!(cloned.status, JobStatus::Completed, "{:?}", cloned.message);
    assert_eq!(
        daemon.linked_names("snapshot"),
        vec![BAR_1.to_string(), FOO_2.to_string(), FOO_3.to_string()]
    );
    let diff = cloned.result.unwrap();
    let diff = diff.as_diff().unwrap();
    assert_eq!(diff.count(DiffKind::Added), 2);

    let trimmed = daemon.run_job(|m| m.trim_packages("stable", 1));
    assert_eq!(trimmed.status, JobStatus::Completed);
    assert_eq!(
        daemon.linked_names("stable"),
        vec![BAR_1.to_string(), FOO_3.to_string()]
    );

    let foo_4 = "foo-1.3-4-1-x86_64.eopkg";
    let dir = daemon.incoming("stable");
    write_archive(&dir, foo_4);
    daemon.run_job(|m| m.bulk_add("stable", &[dir.join(foo_4).as_path()]));

    let pulled = daemon.run_job(|m| m.pull_repo("stable", "snapshot"));
    assert_eq!(pulled.status, JobStatus::Completed);
    let result = pulled.result.unwrap();
    let diff = result.as_diff().unwrap();
    let foo = diff.entries.iter().find(|e| e.name == "foo").unwrap();
    assert_eq!(foo.kind, DiffKind::Modified);
    assert_eq!((foo.left, foo.right), (Some(4), Some(3)));
    assert!(daemon.linked_names("snapshot").contains(&foo_4.to_string()));

    let synced = daemon.run_job(|m| m.sync("stable", "snapshot"));
    assert_eq!(synced.status, JobStatus::Completed);
    assert_eq!(daemon.linked_names("snapshot"), daemon.linked_names("stable"));

    let compared = daemon.run_job(|m| m.compare("stable", "snapshot"));
    assert!(compared.result.unwrap().as_diff().unwrap().is_clean());
}

#[test]
fn test_cherry_pick_and_sources() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1, BAR_1]);
    daemon.create_repo("testing");

    let picked = daemon.run_job(|m| m.cherry_pick("stable", "testing", "bar"));
    assert_eq!(picked.status, JobStatus::Completed, "{:?}", picked.message);
    assert_eq!(daemon.linked_names("testing"), vec![BAR_1.to_string()]);

    let missing = daemon.run_job(|m| m.cherry_pick("stable", "testing", "baz"));
    assert_eq!(missing.status, JobStatus::Failed);

    let copied = daemon.run_job(|m| m.copy_source("stable", "testing", "foo", 1));
    assert_eq!(copied.status, JobStatus::Completed, "{:?}", copied.message);
    assert_eq!(daemon.linked("testing").len(), 2);

    let removed = daemon.run_job(|m| m.remove_source("testing", "bar", 1));
    assert_eq!(removed.status, JobStatus::Completed);
    assert_eq!(daemon.linked_names("testing"), vec![FOO_1.to_string()]);
}

#[test]
fn test_check_and_rescan() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1, BAR_1]);
    let published = daemon.repo_dir("stable").join("f/foo").join(FOO_1);
    fs::remove_file(&published).unwrap();

    let checked = daemon.run_job(|m| m.check("stable"));
    assert_eq!(checked.status, JobStatus::Completed);
    let result = checked.result.unwrap();
    let diff = result.as_diff().unwrap();
    assert_eq!(diff.count(DiffKind::Removed), 1);
    assert_eq!(diff.count(DiffKind::Unchanged), 1);

    let rescanned = daemon.run_job(|m| m.rescan("stable"));
    assert_eq!(rescanned.status, JobStatus::Completed, "{:?}", rescanned.message);
    assert!(published.is_file());

    let checked = daemon.run_job(|m| m.check("stable"));
    assert!(checked.result.unwrap().as_diff().unwrap().count(DiffKind::Removed) == 0);
}

#[test]
fn test_trim_obsolete() {
    let daemon = TestDaemon::new();
    daemon.import("stable", &[FOO_1, BAR_1]);
    fs::write(
        daemon.config.assets_dir("stable").join("distribution.xml"),
        "<PISI><SourceName>Test</SourceName><Obsoletes><Package>bar</Package></Obsoletes></PISI>",
    )
    .unwrap();

    let job = daemon.run_job(|m| m.trim_obsolete("stable"));
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.message);
    assert_eq!(daemon.linked_names("stable"), vec![FOO_1.to_string()]);
}

#[test]
fn test_job_queue_management() {
    let daemon = TestDaemon::new();
    let first = daemon.manager.create_repo("stable").unwrap();
    let second = daemon.manager.create_repo("testing").unwrap();
    daemon.manager.cancel_job(second).unwrap();
    assert_eq!(daemon.manager.get_job(second).unwrap().status, JobStatus::Cancelled);

    daemon.run();
    assert_eq!(daemon.manager.get_job(first).unwrap().status, JobStatus::Completed);
    assert!(daemon.manager.cancel_job(first).is_err());
    assert_eq!(daemon.manager.completed_jobs().unwrap().len(), 1);
    assert_eq!(daemon.manager.failed_jobs().unwrap().len(), 1);

    assert_eq!(daemon.manager.reset_completed().unwrap(), 1);
    assert_eq!(daemon.manager.reset_failed().unwrap(), 1);
    assert!(daemon.manager.completed_jobs().unwrap().is_empty());

    daemon.manager.index("stable").unwrap();
    assert_eq!(daemon.manager.reset_queued().unwrap(), 1);
    assert!(daemon.manager.active_jobs().unwrap().is_empty());
}
