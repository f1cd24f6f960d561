//! Unit tests for planning, applying, and copying.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::connection::{ConnectionManager, HostSpec};
use crate::exec::CommandOutput;
use crate::sink::MemorySink;
use crate::test_support::{CountingResolver, FakeConnector, MemoryTransport};

struct Tree {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Tree {
    fn write(&self, relative: &str, contents: &str) {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, contents).expect("write file");
    }

    fn path(&self, relative: &str) -> Utf8PathBuf {
        self.root.join(relative)
    }
}

#[fixture]
fn tree() -> Tree {
    let dir = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().join("workspace")).expect("utf8");
    std::fs::create_dir_all(&root).expect("create root");
    Tree { _dir: dir, root }
}

fn engine(settings: serde_json::Value) -> SyncEngine {
    SyncEngine::new(Arc::new(FingerprintCache::new()), 2)
        .with_settings(ResolvedSettings::from_value(&settings).expect("valid settings"))
}

fn paths(raw: &[&str]) -> Vec<Utf8PathBuf> {
    raw.iter().map(|path| Utf8PathBuf::from(*path)).collect()
}

/// Destination whose uploads wait for a release and record their overlap.
struct GatedTransport {
    key: String,
    release: Semaphore,
    started: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GatedTransport {
    fn new(key: &str, open: bool) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_owned(),
            release: Semaphore::new(if open { 64 } else { 0 }),
            started: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn open(&self) {
        self.release.add_permits(64);
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Transport for GatedTransport {
    fn destination_key(&self) -> String {
        self.key.clone()
    }

    fn upload<'a>(
        &'a self,
        _local: &'a Utf8Path,
        relative: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .release
                .acquire()
                .await
                .map_err(|err| TransportError::Io {
                    path: relative.to_path_buf(),
                    message: err.to_string(),
                })?;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, _relative: &'a Utf8Path) -> TransportFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn list(&self) -> TransportFuture<'_, Vec<Utf8PathBuf>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[rstest]
#[tokio::test]
async fn second_sync_transfers_only_changed_files(tree: Tree) {
    tree.write("a.txt", "alpha");
    tree.write("nested/b.txt", "beta");
    let engine = engine(json!({"ignore": ["*.tmp"]}));
    let transport = MemoryTransport::new("mem:one");

    let first = engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), false)
        .await
        .expect("first sync");
    assert_eq!(first.transferred, paths(&["a.txt", "nested/b.txt"]));
    assert_eq!(first.unchanged, 0);

    tree.write("a.txt", "alpha, revised");
    let second = engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), false)
        .await
        .expect("second sync");
    assert_eq!(second.transferred, paths(&["a.txt"]));
    assert_eq!(second.unchanged, 1);
    assert_eq!(
        transport.files().get(Utf8Path::new("a.txt")).map(Vec::as_slice),
        Some(b"alpha, revised".as_slice())
    );
}

#[rstest]
#[tokio::test]
async fn failed_uploads_are_not_cached_and_retry_next_time(tree: Tree) {
    tree.write("a.txt", "alpha");
    tree.write("b.txt", "beta");
    let engine = engine(json!(null));
    let transport = MemoryTransport::new("mem:flaky");
    transport.fail_upload("b.txt");

    let result = engine
        .sync_folder(&tree.root, Arc::new(transport.clone()), &IgnoreSet::empty(), false)
        .await
        .expect("sync runs");
    assert_eq!(result.transferred, paths(&["a.txt"]));
    let [failure] = result.failures.as_slice() else {
        panic!("expected one failure: {:?}", result.failures);
    };
    assert_eq!(failure.path, Utf8PathBuf::from("b.txt"));
    assert!(!result.is_success());
    assert_eq!(engine.cache().paths("mem:flaky"), paths(&["a.txt"]));

    let retry = MemoryTransport::new("mem:flaky");
    let again = engine
        .sync_folder(&tree.root, Arc::new(retry.clone()), &IgnoreSet::empty(), false)
        .await
        .expect("sync runs");
    assert_eq!(again.transferred, paths(&["b.txt"]));
    assert_eq!(retry.uploads(), paths(&["b.txt"]));
}

#[rstest]
#[tokio::test]
async fn interrupted_uploads_drop_the_cached_fingerprint(tree: Tree) {
    tree.write("a.txt", "version one");
    let engine = engine(json!(null));
    let transport = MemoryTransport::new("mem:partial");
    engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), false)
        .await
        .expect("first sync");

    tree.write("a.txt", "version two, longer");
    transport.truncate_upload("a.txt");
    let broken = engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), false)
        .await
        .expect("sync runs");
    assert_eq!(broken.failures.len(), 1);
    assert!(engine.cache().paths("mem:partial").is_empty());

    tree.write("a.txt", "version one");
    transport.heal();
    let repaired = engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), false)
        .await
        .expect("sync runs");
    assert_eq!(repaired.transferred, paths(&["a.txt"]));
    assert_eq!(repaired.unchanged, 0);
    assert_eq!(
        transport.files().get(Utf8Path::new("a.txt")).map(Vec::as_slice),
        Some(b"version one".as_slice())
    );
}

#[rstest]
#[tokio::test]
async fn interrupted_copies_drop_the_cached_fingerprint(tree: Tree) {
    tree.write("a.txt", "version one");
    let engine = engine(json!({"enabled": true}));
    let transport = MemoryTransport::new("mem:partial-copy");
    let saved = tree.path("a.txt");
    engine
        .copy_file(&tree.root, &saved, Arc::new(transport.clone()))
        .await;

    tree.write("a.txt", "version two, longer");
    transport.truncate_upload("a.txt");
    let broken = engine
        .copy_file(&tree.root, &saved, Arc::new(transport.clone()))
        .await;
    assert!(!broken.is_success());

    tree.write("a.txt", "version one");
    transport.heal();
    let repaired = engine
        .copy_file(&tree.root, &saved, Arc::new(transport.clone()))
        .await;
    assert_eq!(repaired.transferred, paths(&["a.txt"]));
    assert_eq!(
        transport.files().get(Utf8Path::new("a.txt")).map(Vec::as_slice),
        Some(b"version one".as_slice())
    );
}

#[rstest]
#[tokio::test]
async fn transfers_never_exceed_the_concurrency_limit(tree: Tree) {
    for index in 0..8 {
        tree.write(&format!("file-{index}.txt"), "payload");
    }
    let engine = engine(json!(null));
    let transport = GatedTransport::new("gated:limit", true);

    let result = engine
        .sync_workspace(&tree.root, Arc::clone(&transport) as Arc<dyn Transport>, false)
        .await
        .expect("sync runs");

    assert_eq!(result.transferred.len(), 8);
    assert_eq!(transport.started(), 8);
    assert_eq!(transport.peak(), 2);
}

#[rstest]
#[tokio::test]
async fn syncs_to_one_destination_queue_while_others_proceed(tree: Tree) {
    tree.write("a.txt", "alpha");
    let engine = Arc::new(engine(json!(null)));
    let blocked = GatedTransport::new("gated:shared", false);
    let queued = GatedTransport::new("gated:shared", true);
    let elsewhere = GatedTransport::new("gated:other", true);

    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        let root = tree.root.clone();
        let transport: Arc<dyn Transport> = blocked.clone();
        async move { engine.sync_workspace(&root, transport, false).await }
    });
    while blocked.started() == 0 {
        tokio::task::yield_now().await;
    }

    let second = tokio::spawn({
        let engine = Arc::clone(&engine);
        let root = tree.root.clone();
        let transport: Arc<dyn Transport> = queued.clone();
        async move { engine.sync_workspace(&root, transport, false).await }
    });

    let other = engine
        .sync_workspace(&tree.root, Arc::clone(&elsewhere) as Arc<dyn Transport>, false)
        .await
        .expect("independent destination syncs");
    assert_eq!(other.transferred, paths(&["a.txt"]));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());
    assert_eq!(queued.started(), 0);

    blocked.open();
    let first_result = first.await.expect("join").expect("first sync");
    let second_result = second.await.expect("join").expect("second sync");
    assert_eq!(first_result.transferred, paths(&["a.txt"]));
    assert!(second_result.transferred.is_empty());
    assert_eq!(second_result.unchanged, 1);
    assert_eq!(queued.started(), 0);
}

#[rstest]
#[tokio::test]
async fn orphans_are_removed_only_when_requested(tree: Tree) {
    tree.write("keep.txt", "keep");
    let engine = engine(json!({"ignore": ["*.log"]}));
    let transport = MemoryTransport::new("mem:orphans");
    transport.seed("stale.txt", b"old");
    transport.seed("build.log", b"log");

    let kept = engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), false)
        .await
        .expect("sync runs");
    assert!(kept.deleted.is_empty());
    assert!(transport.files().contains_key(Utf8Path::new("stale.txt")));
    assert!(transport.removals().is_empty());

    let pruned = engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), true)
        .await
        .expect("sync runs");
    assert_eq!(pruned.deleted, paths(&["stale.txt"]));
    assert_eq!(
        transport.files().into_keys().collect::<Vec<_>>(),
        paths(&["build.log", "keep.txt"])
    );
}

#[rstest]
#[tokio::test]
async fn deleting_a_synced_file_forgets_its_fingerprint(tree: Tree) {
    tree.write("a.txt", "alpha");
    tree.write("b.txt", "beta");
    let engine = engine(json!(null));
    let transport = MemoryTransport::new("mem:forget");
    engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), true)
        .await
        .expect("first sync");

    std::fs::remove_file(tree.path("b.txt")).expect("remove");
    let result = engine
        .sync_workspace(&tree.root, Arc::new(transport.clone()), true)
        .await
        .expect("second sync");
    assert_eq!(result.deleted, paths(&["b.txt"]));
    assert_eq!(engine.cache().paths("mem:forget"), paths(&["a.txt"]));
}

#[tokio::test]
async fn missing_source_is_an_error() {
    let engine = engine(json!(null));
    let err = engine
        .sync_folder(
            Utf8Path::new("/nonexistent/playrun/source"),
            Arc::new(MemoryTransport::new("mem:none")),
            &IgnoreSet::empty(),
            false,
        )
        .await
        .expect_err("missing source");
    assert!(matches!(err, SyncError::MissingSource { .. }), "{err}");
}

#[rstest]
#[tokio::test]
async fn copy_makes_no_transport_calls_when_disabled(tree: Tree) {
    tree.write("a.txt", "alpha");
    let engine = engine(json!({"enabled": false}));
    let transport = MemoryTransport::new("mem:disabled");

    let result = engine
        .copy_file(&tree.root, &tree.path("a.txt"), Arc::new(transport.clone()))
        .await;
    assert_eq!(result.skipped, Some(SkipReason::Disabled));
    assert_eq!(transport.calls(), 0);
}

#[rstest]
#[case("notes.tmp", Some(SkipReason::Ignored))]
#[case("target/debug/app", Some(SkipReason::Ignored))]
#[case("src/main.yml", None)]
fn copy_decision_honours_ignore_patterns(
    tree: Tree,
    #[case] relative: &str,
    #[case] expected: Option<SkipReason>,
) {
    let engine = engine(json!({"enabled": true, "ignore": ["*.tmp", "target"]}));
    let decision = engine.copy_decision(&tree.root, &tree.path(relative));
    assert_eq!(decision.err(), expected);
}

#[rstest]
fn copy_decision_rejects_paths_outside_the_workspace(tree: Tree) {
    let engine = engine(json!({"enabled": true}));
    assert_eq!(
        engine.copy_decision(&tree.root, Utf8Path::new("/etc/hosts")),
        Err(SkipReason::OutsideWorkspace)
    );
    assert_eq!(
        engine.copy_decision(&tree.root, &tree.root),
        Err(SkipReason::OutsideWorkspace)
    );
}

#[rstest]
#[tokio::test]
async fn copy_uploads_once_then_reports_unchanged(tree: Tree) {
    tree.write("roles/web.yml", "- name: web");
    let engine = engine(json!({"enabled": true}));
    let transport = MemoryTransport::new("mem:copy");

    let first = engine
        .copy_file(&tree.root, &tree.path("roles/web.yml"), Arc::new(transport.clone()))
        .await;
    assert_eq!(first.transferred, paths(&["roles/web.yml"]));

    let second = engine
        .copy_file(&tree.root, &tree.path("roles/web.yml"), Arc::new(transport.clone()))
        .await;
    assert!(second.transferred.is_empty());
    assert_eq!(second.unchanged, 1);
    assert_eq!(transport.uploads(), paths(&["roles/web.yml"]));
}

#[rstest]
#[tokio::test]
async fn copy_records_read_failures(tree: Tree) {
    let engine = engine(json!({"enabled": true}));
    let result = engine
        .copy_file(
            &tree.root,
            &tree.path("missing.yml"),
            Arc::new(MemoryTransport::new("mem:missing")),
        )
        .await;
    assert_eq!(result.failures.len(), 1);
    assert!(!result.is_success());
}

#[rstest]
#[tokio::test]
async fn local_transport_mirrors_the_tree(tree: Tree) {
    tree.write("a.txt", "alpha");
    tree.write("deep/er/b.txt", "beta");
    let target_dir = TempDir::new().expect("tempdir");
    let target = Utf8PathBuf::from_path_buf(target_dir.path().join("mirror")).expect("utf8");
    let transport = Arc::new(LocalTransport::new(target.clone()));
    let engine = engine(json!(null));

    let result = engine
        .sync_workspace(&tree.root, transport.clone(), false)
        .await
        .expect("sync runs");
    assert_eq!(result.transferred, paths(&["a.txt", "deep/er/b.txt"]));
    assert_eq!(
        std::fs::read_to_string(target.join("deep/er/b.txt")).expect("copied"),
        "beta"
    );
    assert_eq!(
        transport.list().await.expect("listing"),
        paths(&["a.txt", "deep/er/b.txt"])
    );

    transport
        .remove(Utf8Path::new("a.txt"))
        .await
        .expect("remove");
    transport
        .remove(Utf8Path::new("a.txt"))
        .await
        .expect("removing twice is fine");
    assert!(!target.join("a.txt").exists());
}

#[test]
fn result_report_summarises_then_lists_failures() {
    let sink = MemorySink::new();
    let result = SyncResult {
        destination: String::from("ssh:host:/srv"),
        transferred: paths(&["a.txt"]),
        failures: vec![TransferFailure {
            path: Utf8PathBuf::from("b.txt"),
            message: String::from("permission denied"),
        }],
        ..SyncResult::default()
    };
    result.report(&sink);
    assert_eq!(
        sink.lines(),
        vec![
            String::from("[sync] ssh:host:/srv: 1 transferred, 0 deleted, 0 unchanged, 1 failed"),
            String::from("[sync] failed b.txt: permission denied"),
        ]
    );
}

#[test]
fn null_settings_mean_disabled_defaults() {
    let settings = SyncSettings::from_value(&json!(null)).expect("null is valid");
    assert_eq!(settings, SyncSettings::default());
    assert!(!settings.enabled);
}

#[rstest]
#[case(json!({"ignore": "*.tmp"}))]
#[case(json!({"ignore": ["a[b"]}))]
#[case(json!("enabled"))]
fn malformed_settings_are_rejected(#[case] value: serde_json::Value) {
    assert!(ResolvedSettings::from_value(&value).is_err());
}

#[test]
fn invalid_settings_disable_syncing() {
    let active = ActiveSettings::new(
        ResolvedSettings::from_value(&json!({"enabled": true})).expect("valid"),
    );
    assert!(active.current().settings.enabled);

    let err = active
        .apply_value(&json!({"enabled": "yes"}))
        .expect_err("wrong type");
    assert!(err.to_string().contains("invalid sync configuration"));
    assert!(!active.current().settings.enabled);
}

#[test]
fn settings_read_camel_case_destination() {
    let settings = SyncSettings::from_value(&json!({
        "enabled": true,
        "destination": "/srv/site",
        "ignore": [".git"]
    }))
    .expect("valid");
    assert_eq!(settings.destination.as_deref(), Some("/srv/site"));
    assert_eq!(settings.ignore, vec![String::from(".git")]);
}

#[test]
fn ignore_sets_match_ancestors() {
    let ignore = IgnoreSet::new(["target", " ", "*.tmp"]).expect("valid patterns");
    assert_eq!(ignore.patterns(), ["target", "*.tmp"]);
    assert!(ignore.is_ignored(Utf8Path::new("target/debug/app")));
    assert!(ignore.is_ignored(Utf8Path::new("logs/run.tmp")));
    assert!(!ignore.is_ignored(Utf8Path::new("src/target.rs")));
    assert!(!IgnoreSet::empty().is_ignored(Utf8Path::new("anything")));
}

#[rstest]
fn file_fingerprints_match_buffer_fingerprints(tree: Tree) {
    tree.write("a.txt", "alpha");
    let from_file = Fingerprint::of_file(&tree.path("a.txt")).expect("readable");
    assert_eq!(from_file, Fingerprint::of_bytes(b"alpha"));
    assert_eq!(from_file.len, 5);
    assert_ne!(from_file, Fingerprint::of_bytes(b"alpha!"));
}

#[test]
fn cache_entries_are_scoped_per_destination() {
    let cache = FingerprintCache::new();
    let path = Utf8Path::new("a.txt");
    cache.record("one", path, Fingerprint::of_bytes(b"x"));
    assert_eq!(cache.get("one", path), Some(Fingerprint::of_bytes(b"x")));
    assert_eq!(cache.get("two", path), None);

    cache.forget("one", path);
    assert!(cache.paths("one").is_empty());
}

#[rstest]
fn plans_classify_added_and_modified_files(tree: Tree) {
    tree.write("a.txt", "alpha");
    tree.write("b.txt", "beta");
    let cache = FingerprintCache::new();
    cache.record("dest", Utf8Path::new("a.txt"), Fingerprint::of_bytes(b"old"));

    let snapshot = scan(&tree.root, &IgnoreSet::empty()).expect("scan");
    let plan = build_plan(&tree.root, "dest", &snapshot, &cache);
    let changes: Vec<(String, ChangeKind)> = plan
        .deltas
        .iter()
        .map(|delta| (delta.path.to_string(), delta.change))
        .collect();
    assert_eq!(
        changes,
        vec![
            (String::from("a.txt"), ChangeKind::Modified),
            (String::from("b.txt"), ChangeKind::Added),
        ]
    );
    assert!(!plan.is_empty());
}

#[test]
fn remote_workspace_path_uses_the_workspace_name() {
    assert_eq!(
        remote_workspace_path("/srv/playrun/", Utf8Path::new("/home/me/site")),
        "/srv/playrun/site"
    );
}

#[tokio::test]
async fn remote_listings_keep_names_with_spaces_and_newlines() {
    let connector = FakeConnector::new();
    connector.respond_to(
        "find . -type f -print0",
        CommandOutput {
            code: Some(0),
            stdout: String::from("./ padded name \0./roles/line\nbreak.yml\0./site.yml\0"),
            stderr: String::new(),
        },
    );
    let connections = ConnectionManager::new(connector.clone(), CountingResolver::new());
    let host = HostSpec::new("deploy", "build.example.com", 22);
    let lease = connections.acquire(&host).await.expect("lease");
    let transport = SshTransport::new(lease, "/srv/work");

    let listed = transport.list().await.expect("listing");

    assert_eq!(
        listed,
        paths(&[" padded name ", "roles/line\nbreak.yml", "site.yml"])
    );
    let commands = connector.last().expect("connected").commands();
    assert!(
        commands
            .iter()
            .any(|command| command.contains("cd /srv/work && find . -type f -print0")),
        "{commands:?}"
    );
}
