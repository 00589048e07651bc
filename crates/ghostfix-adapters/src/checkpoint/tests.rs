use super::*;
use anyhow::Result;
use std::path::Path;
use tempfile::{tempdir, TempDir};

/// Pretends the project is not a git repository so file selection is
/// deterministic.
struct NoGit;

impl GitInspector for NoGit {
    fn git_state(&self, _root: &Path) -> ghostfix_core::protocol::GitState {
        ghostfix_core::protocol::GitState::default()
    }

    fn modified_files(&self, _root: &Path) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Reports a fixed list of modified files.
struct FakeGit(Vec<PathBuf>);

impl GitInspector for FakeGit {
    fn git_state(&self, _root: &Path) -> ghostfix_core::protocol::GitState {
        ghostfix_core::protocol::GitState {
            is_repo: true,
            branch: Some("main".into()),
            commit: Some("abc123".into()),
            dirty: true,
        }
    }

    fn modified_files(&self, _root: &Path) -> Result<Vec<PathBuf>> {
        Ok(self.0.clone())
    }
}

fn project() -> (TempDir, CheckpointStore) {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("src/app.ts"), "export const app = 1;\n").unwrap();
    fs::write(dir.path().join("src/env.ts"), "export const env = process.env;\n").unwrap();
    let store = CheckpointStore::open(dir.path(), CheckpointConfig::default())
        .unwrap()
        .with_git(Arc::new(NoGit));
    (dir, store)
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

#[test]
fn open_rejects_missing_root() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope");
    let err = CheckpointStore::open(&missing, CheckpointConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, CheckpointError::MissingProjectRoot(_)));
    assert!(!err.hint().is_empty());
}

#[test]
fn create_then_restore_round_trips_content() {
    let (dir, store) = project();
    let original = fs::read(dir.path().join("src/app.ts")).unwrap();

    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts"]))
        .unwrap();
    assert_eq!(cp.files.len(), 1);
    assert_eq!(cp.files[0].hash, hash_bytes(&original));
    assert_eq!(cp.files[0].size, original.len() as u64);

    write(dir.path(), "src/app.ts", "export const app = 2; // broken\n");
    let report = store
        .restore(
            &cp.id,
            RestoreOptions {
                backup_first: false,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(report.restored, vec![PathBuf::from("src/app.ts")]);
    assert!(report.backup_id.is_none());
    let restored = fs::read(dir.path().join("src/app.ts")).unwrap();
    assert_eq!(restored, original);
    assert_eq!(hash_bytes(&restored), cp.files[0].hash);
}

#[test]
fn create_writes_manifest_and_index() {
    let (_dir, store) = project();
    let cp = store
        .create(
            CreateOptions::new(CheckpointReason::Command)
                .files(["src/app.ts", "src/env.ts"])
                .tag("pre fix")
                .command("ghostfix fix --all"),
        )
        .unwrap();

    assert!(cp.id.starts_with("CP_"));
    assert!(cp.id.ends_with("_pre-fix"));
    assert!(store.dir().join(&cp.id).join("manifest.json").is_file());
    assert!(store.dir().join(&cp.id).join("files/src/env.ts").is_file());

    let entries = store.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].file_count, 2);
    assert_eq!(entries[0].total_size, cp.metadata.total_size);
    assert_eq!(entries[0].tag.as_deref(), Some("pre fix"));

    let loaded = store.get(&cp.id).unwrap();
    assert_eq!(loaded, cp);
    assert_eq!(loaded.metadata.command.as_deref(), Some("ghostfix fix --all"));
}

#[test]
fn checkpoint_id_has_timestamp_and_random_parts() {
    let id = new_checkpoint_id(Utc::now(), None);
    let parts: Vec<&str> = id.split('_').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "CP");
    assert_eq!(parts[1].len(), 14);
    assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
    assert_eq!(parts[2].len(), 8);
    assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn create_without_files_walks_source_tree() {
    let (dir, store) = project();
    write(dir.path(), "node_modules/pkg/index.js", "module.exports = 1;");
    write(dir.path(), "assets/logo.png", "not really a png");
    write(dir.path(), ".ghostfix/config.json", "{}");

    let cp = store.create(CreateOptions::new(CheckpointReason::AutoSave)).unwrap();
    let paths: Vec<&Path> = cp.files.iter().map(|f| f.path.as_path()).collect();
    assert_eq!(paths, vec![Path::new("src/app.ts"), Path::new("src/env.ts")]);
}

#[test]
fn walk_is_capped() {
    let (dir, store) = project();
    for i in 0..(MAX_WALK_FILES + 20) {
        write(dir.path(), &format!("lib/mod_{:03}.ts", i), "export {};");
    }
    let cp = store.create(CreateOptions::new(CheckpointReason::AutoSave)).unwrap();
    assert_eq!(cp.files.len(), MAX_WALK_FILES);
}

#[test]
fn create_prefers_git_modified_files() {
    let (dir, _) = project();
    let store = CheckpointStore::open(dir.path(), CheckpointConfig::default())
        .unwrap()
        .with_git(Arc::new(FakeGit(vec![
            PathBuf::from("src/env.ts"),
            PathBuf::from("src/deleted.ts"),
        ])));

    let cp = store.create(CreateOptions::new(CheckpointReason::Autofix)).unwrap();
    assert_eq!(cp.files.len(), 1);
    assert_eq!(cp.files[0].path, PathBuf::from("src/env.ts"));
    assert_eq!(cp.metadata.git_branch.as_deref(), Some("main"));
    assert!(cp.metadata.git_dirty);
}

#[test]
fn create_fails_when_nothing_qualifies() {
    let (_dir, store) = project();
    let err = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/missing.ts"]))
        .unwrap_err();
    assert!(matches!(err, CheckpointError::NoFilesToCheckpoint));
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn create_rejects_paths_outside_root() {
    let (_dir, store) = project();
    let err = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["../outside.ts"]))
        .unwrap_err();
    assert!(matches!(err, CheckpointError::PathEscapesRoot(_)));
}

#[test]
fn restore_backs_up_current_state_first() {
    let (dir, store) = project();
    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts"]))
        .unwrap();
    write(dir.path(), "src/app.ts", "changed");

    let report = store.restore(&cp.id, RestoreOptions::default()).unwrap();
    let backup_id = report.backup_id.expect("safety backup");
    let backup = store.get(&backup_id).unwrap();
    assert_eq!(backup.reason, CheckpointReason::BeforeRestore);
    assert_eq!(
        backup.tag.as_deref(),
        Some(format!("before-restore-{}", cp.id).as_str())
    );

    // Undo the restore through the safety backup.
    store
        .restore(
            &backup_id,
            RestoreOptions {
                backup_first: false,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("src/app.ts")).unwrap(), "changed");
}

#[test]
fn restore_dry_run_writes_nothing() {
    let (dir, store) = project();
    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts"]))
        .unwrap();
    write(dir.path(), "src/app.ts", "changed");

    let report = store
        .restore(
            "latest",
            RestoreOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.checkpoint_id, cp.id);
    assert_eq!(report.restored, vec![PathBuf::from("src/app.ts")]);
    assert!(report.backup_id.is_none());
    assert_eq!(fs::read_to_string(dir.path().join("src/app.ts")).unwrap(), "changed");
    assert_eq!(store.list().unwrap().len(), 1);
}

#[test]
fn restore_only_files_and_recreates_deleted() {
    let (dir, store) = project();
    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts", "src/env.ts"]))
        .unwrap();
    fs::remove_dir_all(dir.path().join("src")).unwrap();

    let report = store
        .restore(
            &cp.id,
            RestoreOptions {
                only_files: Some(vec![PathBuf::from("./src/env.ts"), PathBuf::from("src/other.ts")]),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(report.restored, vec![PathBuf::from("src/env.ts")]);
    assert_eq!(report.skipped, vec![PathBuf::from("src/other.ts")]);
    // nothing existed to back up
    assert!(report.backup_id.is_none());
    assert!(dir.path().join("src/env.ts").is_file());
    assert!(!dir.path().join("src/app.ts").exists());
}

#[test]
fn restore_skips_missing_stored_content() {
    let (dir, store) = project();
    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts", "src/env.ts"]))
        .unwrap();
    fs::remove_file(store.dir().join(&cp.id).join("files/src/app.ts")).unwrap();
    write(dir.path(), "src/env.ts", "changed");

    let report = store
        .restore(
            &cp.id,
            RestoreOptions {
                backup_first: false,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(report.skipped, vec![PathBuf::from("src/app.ts")]);
    assert_eq!(report.restored, vec![PathBuf::from("src/env.ts")]);
}

#[test]
fn restore_refuses_manifest_paths_outside_root() {
    let (_dir, store) = project();
    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts"]))
        .unwrap();

    let manifest_path = store.dir().join(&cp.id).join("manifest.json");
    let mut tampered = cp.clone();
    tampered.files[0].path = PathBuf::from("../escaped.ts");
    fs::write(&manifest_path, serde_json::to_string(&tampered).unwrap()).unwrap();

    let err = store.restore(&cp.id, RestoreOptions::default()).unwrap_err();
    assert!(matches!(err, CheckpointError::PathEscapesRoot(_)));
}

#[cfg(unix)]
#[test]
fn restore_refuses_to_write_through_symlinks() {
    let (dir, store) = project();
    let outside = tempdir().unwrap();
    let victim = outside.path().join("victim.txt");
    fs::write(&victim, "outside\n").unwrap();

    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts"]))
        .unwrap();
    fs::remove_file(dir.path().join("src/app.ts")).unwrap();
    std::os::unix::fs::symlink(&victim, dir.path().join("src/app.ts")).unwrap();

    for options in [
        RestoreOptions {
            backup_first: false,
            ..Default::default()
        },
        RestoreOptions::default(),
    ] {
        let err = store.restore(&cp.id, options).unwrap_err();
        assert!(matches!(err, CheckpointError::PathEscapesRoot(_)));
    }
    assert_eq!(fs::read_to_string(&victim).unwrap(), "outside\n");
    // Nothing was backed up either.
    assert_eq!(store.list().unwrap().len(), 1);
}

#[test]
fn restore_at_prune_limit_keeps_its_checkpoint() {
    let dir = tempdir().unwrap();
    write(dir.path(), "src/a.ts", "v1");
    let config = CheckpointConfig {
        max_checkpoints: 2,
        ..Default::default()
    };
    let store = CheckpointStore::open(dir.path(), config)
        .unwrap()
        .with_git(Arc::new(NoGit));

    let first = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/a.ts"]))
        .unwrap();
    write(dir.path(), "src/a.ts", "v2");
    let second = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/a.ts"]))
        .unwrap();
    write(dir.path(), "src/a.ts", "v3");

    let report = store.restore(&first.id, RestoreOptions::default()).unwrap();
    assert_eq!(report.restored, vec![PathBuf::from("src/a.ts")]);
    assert_eq!(fs::read_to_string(dir.path().join("src/a.ts")).unwrap(), "v1");

    let backup_id = report.backup_id.unwrap();
    let remaining: Vec<String> = store.list().unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(remaining, vec![backup_id.clone(), first.id.clone()]);
    assert!(!remaining.contains(&second.id));

    // The backup holds v3 and can undo the restore.
    store
        .restore(
            &backup_id,
            RestoreOptions {
                backup_first: false,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("src/a.ts")).unwrap(), "v3");
}

#[cfg(target_os = "linux")]
#[test]
fn failed_create_leaves_no_partial_checkpoint() {
    let (dir, store) = project();
    // A source path just under PATH_MAX fits in the project but not under
    // the longer checkpoint storage prefix.
    let root_len = dir.path().canonicalize().unwrap().as_os_str().len();
    let mut remaining = 4_080 - (root_len + 1);
    let mut relative = String::new();
    while remaining > 250 {
        relative.push_str(&"d".repeat(200));
        relative.push('/');
        remaining -= 201;
    }
    relative.push_str(&"f".repeat(remaining - 3));
    relative.push_str(".ts");
    write(dir.path(), &relative, "deep");

    let err = store
        .create(CreateOptions::new(CheckpointReason::Manual).files([relative.as_str(), "src/app.ts"]))
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Io(_)));

    assert!(store.list().unwrap().is_empty());
    let leftovers: Vec<_> = fs::read_dir(store.dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("CP_"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn diff_classifies_files() {
    let (dir, store) = project();
    write(dir.path(), "src/keep.ts", "same");
    let cp = store
        .create(
            CreateOptions::new(CheckpointReason::Manual).files([
                "src/app.ts",
                "src/env.ts",
                "src/keep.ts",
            ]),
        )
        .unwrap();
    write(dir.path(), "src/app.ts", "edited");
    fs::remove_file(dir.path().join("src/env.ts")).unwrap();
    write(dir.path(), "src/added.ts", "new file outside scope");

    let diff = store.diff(&cp.id).unwrap();
    assert_eq!(diff.changed, vec![PathBuf::from("src/app.ts")]);
    assert_eq!(diff.deleted, vec![PathBuf::from("src/env.ts")]);
    assert_eq!(diff.unchanged, vec![PathBuf::from("src/keep.ts")]);
    assert!(diff.has_changes());
}

#[test]
fn resolve_handles_aliases_tags_and_prefixes() {
    let (_dir, store) = project();
    let first = store
        .create(
            CreateOptions::new(CheckpointReason::Manual)
                .files(["src/app.ts"])
                .tag("baseline"),
        )
        .unwrap();
    let second = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/env.ts"]))
        .unwrap();

    assert_eq!(store.resolve("latest").unwrap(), second.id);
    assert_eq!(store.resolve("baseline").unwrap(), first.id);
    assert_eq!(store.resolve(&first.id).unwrap(), first.id);
    let prefix = &second.id[..second.id.len() - 1];
    assert_eq!(store.resolve(prefix).unwrap(), second.id);
    assert!(matches!(
        store.resolve("CP_").unwrap_err(),
        CheckpointError::Ambiguous { count: 2, .. }
    ));
    let missing = store.resolve("CP_19990101").unwrap_err();
    assert!(matches!(missing, CheckpointError::NotFound(_)));
    assert!(missing.hint().contains("latest"));
    assert_eq!(store.get_latest().unwrap().map(|cp| cp.id), Some(second.id));
}

#[test]
fn get_latest_is_none_for_empty_store() {
    let (_dir, store) = project();
    assert!(store.get_latest().unwrap().is_none());
    assert_eq!(store.stats().unwrap(), CheckpointStats::default());
}

#[test]
fn delete_removes_entry_and_storage() {
    let (_dir, store) = project();
    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts"]))
        .unwrap();
    let removed = store.delete(&cp.id).unwrap();
    assert_eq!(removed.id, cp.id);
    assert!(!store.dir().join(&cp.id).exists());
    assert!(matches!(store.get(&cp.id).unwrap_err(), CheckpointError::NotFound(_)));
}

#[test]
fn prune_keeps_most_recent() {
    let (_dir, store) = project();
    let a = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts"]))
        .unwrap();
    let b = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/env.ts"]))
        .unwrap();
    let c = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts", "src/env.ts"]))
        .unwrap();

    let report = store
        .prune(PruneOptions {
            keep: Some(1),
            ..Default::default()
        })
        .unwrap();

    let mut deleted = report.deleted.clone();
    deleted.sort();
    let mut expected = vec![a.id.clone(), b.id.clone()];
    expected.sort();
    assert_eq!(deleted, expected);
    assert_eq!(
        report.freed_bytes,
        a.metadata.total_size + b.metadata.total_size
    );

    let remaining: Vec<String> = store.list().unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(remaining, vec![c.id]);
    assert!(!store.dir().join(&a.id).exists());
}

#[test]
fn prune_dry_run_and_age_cutoff() {
    let (_dir, store) = project();
    for _ in 0..3 {
        store
            .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts"]))
            .unwrap();
    }

    let dry = store
        .prune(PruneOptions {
            keep: Some(0),
            dry_run: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(dry.deleted.len(), 3);
    assert_eq!(store.list().unwrap().len(), 3);

    // Everything is newer than a week, so nothing goes.
    let aged = store
        .prune(PruneOptions {
            older_than_days: Some(7),
            ..Default::default()
        })
        .unwrap();
    assert!(aged.deleted.is_empty());

    let untouched = store.prune(PruneOptions::default()).unwrap();
    assert!(untouched.deleted.is_empty());
}

#[test]
fn auto_prune_enforces_count_limit() {
    let dir = tempdir().unwrap();
    write(dir.path(), "src/a.ts", "a");
    let config = CheckpointConfig {
        max_checkpoints: 2,
        ..Default::default()
    };
    let store = CheckpointStore::open(dir.path(), config)
        .unwrap()
        .with_git(Arc::new(NoGit));

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(
            store
                .create(CreateOptions::new(CheckpointReason::Autofix).files(["src/a.ts"]))
                .unwrap()
                .id,
        );
    }
    let remaining: Vec<String> = store.list().unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(remaining, vec![ids[3].clone(), ids[2].clone()]);
}

#[cfg(unix)]
#[test]
fn unreadable_files_are_skipped() {
    use std::os::unix::fs::PermissionsExt;

    let (dir, store) = project();
    let locked = dir.path().join("src/env.ts");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read(&locked).is_ok() {
        // Running as root; permissions are not enforced.
        return;
    }

    let cp = store
        .create(CreateOptions::new(CheckpointReason::Manual).files(["src/app.ts", "src/env.ts"]))
        .unwrap();
    assert_eq!(cp.files.len(), 1);
    assert_eq!(cp.files[0].path, PathBuf::from("src/app.ts"));
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
}
