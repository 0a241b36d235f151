//! Contract tests run against both the in-memory fake and SurrealDB (`mem://`).

use remotex_state::fakes::MemoryStore;
use remotex_state::{
    BuildLedger, BuildOutcome, BuildStatus, FailureReason, FileIndex, FileRecord, Persistence,
    ProjectCatalog, StorageError, Subdir, SurrealStore,
};

async fn catalog_contract<S: Persistence>(store: &S) {
    store.create_user("alice").await.unwrap();
    assert!(matches!(
        store.create_user("alice").await,
        Err(StorageError::UserExists { .. })
    ));

    assert!(matches!(
        store.create_project("nobody", "thesis", false).await,
        Err(StorageError::UserNotFound { .. })
    ));

    let first = store.create_project("alice", "thesis", false).await.unwrap();
    let second = store.create_project("alice", "slides", true).await.unwrap();
    assert!(matches!(
        store.create_project("alice", "thesis", true).await,
        Err(StorageError::ProjectExists { .. })
    ));

    let resolved = store.resolve_project("alice", "thesis").await.unwrap();
    assert_eq!(resolved.project_id, first.project_id);
    assert!(!resolved.public);

    let listed = store.list_projects("alice").await.unwrap();
    let names: Vec<&str> = listed.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"thesis") && names.contains(&"slides"));

    store.delete_project(&second.project_id).await.unwrap();
    let err = store.resolve_project("alice", "slides").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(store.delete_project(&second.project_id).await.is_err());
}

async fn ledger_contract<S: Persistence>(store: &S) {
    store.create_user("bob").await.unwrap();
    let project = store.create_project("bob", "paper", false).await.unwrap();
    let pid = project.project_id;

    let opts = serde_json::json!({"engine": "pdf", "force": true});
    let build = store.begin_build(&pid, opts.clone()).await.unwrap();
    assert_eq!(build.status, BuildStatus::Pending);
    assert_eq!(build.options, opts);

    // second pending build for the same project is rejected
    let err = store
        .begin_build(&pid, serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::BuildInProgress { .. }));

    let pending = store.pending_build(&pid).await.unwrap().unwrap();
    assert_eq!(pending.build_id, build.build_id);

    // non-terminal outcome is rejected
    let bad = store
        .finish_build(
            &build.build_id,
            BuildOutcome {
                status: BuildStatus::Pending,
                duration_ms: 1,
                output: String::new(),
            },
        )
        .await;
    assert!(matches!(bad, Err(StorageError::InvalidBuildState { .. })));

    let finished = store
        .finish_build(
            &build.build_id,
            BuildOutcome {
                status: BuildStatus::Failed(FailureReason::ExitCode(1)),
                duration_ms: 42,
                output: "! Undefined control sequence.".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(finished.status, BuildStatus::Failed(FailureReason::ExitCode(1)));

    // exactly one transition
    let again = store
        .finish_build(
            &build.build_id,
            BuildOutcome {
                status: BuildStatus::Finished,
                duration_ms: 1,
                output: String::new(),
            },
        )
        .await;
    assert!(matches!(again, Err(StorageError::InvalidBuildState { .. })));

    let stored = store.get_build(&build.build_id).await.unwrap();
    assert_eq!(stored.duration_ms, 42);
    assert_eq!(stored.output, "! Undefined control sequence.");
    assert!(store.pending_build(&pid).await.unwrap().is_none());

    let next = store.begin_build(&pid, serde_json::Value::Null).await.unwrap();
    store
        .finish_build(
            &next.build_id,
            BuildOutcome {
                status: BuildStatus::Failed(FailureReason::Internal),
                duration_ms: 7,
                output: String::new(),
            },
        )
        .await
        .unwrap();

    let history = store.list_builds(&pid).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].build_id, next.build_id);
    assert_eq!(
        history[0].status,
        BuildStatus::Failed(FailureReason::Internal)
    );

    // deleting the project cascades to its builds
    store.delete_project(&pid).await.unwrap();
    assert!(store.list_builds(&pid).await.unwrap().is_empty());
    assert!(store.get_build(&next.build_id).await.unwrap_err().is_not_found());
}

async fn concurrent_begin_contract<S: Persistence>(store: &S) {
    store.create_user("carol").await.unwrap();
    let pid = store
        .create_project("carol", "notes", false)
        .await
        .unwrap()
        .project_id;

    let (a, b) = tokio::join!(
        store.begin_build(&pid, serde_json::Value::Null),
        store.begin_build(&pid, serde_json::Value::Null),
    );
    let won = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(won, 1, "exactly one concurrent begin succeeds");
    let lost = if a.is_ok() { b } else { a };
    assert!(matches!(lost, Err(StorageError::BuildInProgress { .. })));

    let pending: Vec<_> = store
        .list_builds(&pid)
        .await
        .unwrap()
        .into_iter()
        .filter(|b| b.status == BuildStatus::Pending)
        .collect();
    assert_eq!(pending.len(), 1);
}

async fn stale_build_contract<S: Persistence>(store: &S) {
    store.create_user("dave").await.unwrap();
    let pid = store
        .create_project("dave", "book", false)
        .await
        .unwrap()
        .project_id;
    let stuck = store.begin_build(&pid, serde_json::Value::Null).await.unwrap();

    // a cutoff before the build started leaves it alone
    let earlier = stuck.started_at - chrono::Duration::seconds(60);
    let none = store.abandon_stale_builds(earlier, "abandoned").await.unwrap();
    assert!(none.is_empty());
    assert!(store.pending_build(&pid).await.unwrap().is_some());

    let later = chrono::Utc::now() + chrono::Duration::seconds(1);
    let abandoned = store.abandon_stale_builds(later, "abandoned").await.unwrap();
    assert_eq!(abandoned, vec![stuck.build_id.clone()]);

    let record = store.get_build(&stuck.build_id).await.unwrap();
    assert_eq!(record.status, BuildStatus::Failed(FailureReason::Internal));
    assert_eq!(record.output, "abandoned");
    assert!(store.pending_build(&pid).await.unwrap().is_none());

    // the project can build again
    store.begin_build(&pid, serde_json::Value::Null).await.unwrap();
}

async fn file_index_contract<S: Persistence>(store: &S) {
    store.create_user("carol").await.unwrap();
    let project = store.create_project("carol", "book", false).await.unwrap();
    let pid = project.project_id;

    store
        .replace_files(
            &pid,
            Subdir::Src,
            vec![
                FileRecord::from_content("main.tex", b"\\documentclass{book}"),
                FileRecord::from_content("img/a.png", b"a"),
                FileRecord::from_content("img/b.png", b"b"),
                FileRecord::from_content("imgs/c.png", b"c"),
            ],
        )
        .await
        .unwrap();
    store
        .replace_files(&pid, Subdir::Out, vec![FileRecord::from_content("main.pdf", b"%PDF")])
        .await
        .unwrap();

    store.remove_path(&pid, Subdir::Src, "img").await.unwrap();
    let mut src: Vec<String> = store
        .list_files(&pid, Subdir::Src)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    src.sort();
    assert_eq!(src, vec!["imgs/c.png", "main.tex"]);

    let updated = FileRecord::from_content("main.tex", b"\\documentclass{article}");
    store
        .upsert_file(&pid, Subdir::Src, updated.clone())
        .await
        .unwrap();
    let src = store.list_files(&pid, Subdir::Src).await.unwrap();
    assert_eq!(src.len(), 2);
    assert!(src.contains(&updated));

    // subdirs are independent
    assert_eq!(store.list_files(&pid, Subdir::Out).await.unwrap().len(), 1);
    assert!(store.list_files(&pid, Subdir::Aux).await.unwrap().is_empty());

    store.replace_files(&pid, Subdir::Out, Vec::new()).await.unwrap();
    assert!(store.list_files(&pid, Subdir::Out).await.unwrap().is_empty());

    store.delete_project(&pid).await.unwrap();
    assert!(store.list_files(&pid, Subdir::Src).await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_store_catalog() {
    catalog_contract(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_store_ledger() {
    ledger_contract(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_store_file_index() {
    file_index_contract(&MemoryStore::new()).await;
}

#[tokio::test]
async fn surreal_store_catalog() {
    catalog_contract(&SurrealStore::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn surreal_store_ledger() {
    ledger_contract(&SurrealStore::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn surreal_store_file_index() {
    file_index_contract(&SurrealStore::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn memory_store_concurrent_begin() {
    concurrent_begin_contract(&MemoryStore::new()).await;
}

#[tokio::test]
async fn surreal_store_concurrent_begin() {
    concurrent_begin_contract(&SurrealStore::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn memory_store_stale_builds() {
    stale_build_contract(&MemoryStore::new()).await;
}

#[tokio::test]
async fn surreal_store_stale_builds() {
    stale_build_contract(&SurrealStore::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn surreal_store_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let store = SurrealStore::open_local(&path).await.unwrap();
    assert!(path.is_dir());
    file_index_contract(&store).await;
}
