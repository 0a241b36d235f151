//! Push/pull reconciliation against a directory-backed remote.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use remotex_core::tree;
use remotex_core::{
    build_and_sync, clone_into, diff, pull, push, scan_manifest, BuildEndpoint, BuildOptions,
    RemoteEndpoint, RemotexError, Result,
};
use remotex_state::{FileRecord, Subdir};

/// Remote whose subdirs are plain directories, counting transfers.
struct DirRemote {
    root: PathBuf,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    /// `Some(code)` makes `build` fail like a driver exiting with `code`
    fail_build: Option<i32>,
}

impl DirRemote {
    fn new(root: &Path) -> Self {
        for subdir in Subdir::ALL {
            std::fs::create_dir_all(root.join(subdir.as_str())).unwrap();
        }
        Self {
            root: root.to_path_buf(),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            fail_build: None,
        }
    }

    fn dir(&self, subdir: Subdir) -> PathBuf {
        self.root.join(subdir.as_str())
    }

    fn manifest(&self, subdir: Subdir) -> Vec<FileRecord> {
        scan_manifest(&self.dir(subdir)).unwrap().manifest
    }
}

#[async_trait]
impl RemoteEndpoint for DirRemote {
    async fn list_files(&self, subdir: Subdir) -> Result<Vec<FileRecord>> {
        Ok(scan_manifest(&self.dir(subdir))?.manifest)
    }

    async fn upload(&self, subdir: Subdir, path: &str, data: Vec<u8>) -> Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        tree::write_file(&self.dir(subdir), path, &data)?;
        Ok(())
    }

    async fn download(&self, subdir: Subdir, path: &str) -> Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(tree::read_file(&self.dir(subdir), path)?)
    }

    async fn delete(&self, subdir: Subdir, path: &str) -> Result<()> {
        tree::remove_path(&self.dir(subdir), path)?;
        Ok(())
    }
}

#[async_trait]
impl BuildEndpoint for DirRemote {
    /// "Compiles" `src/main.tex` into `out/main.pdf` and `aux/main.log`.
    async fn build(&self, _options: &BuildOptions) -> Result<String> {
        if let Some(exit_code) = self.fail_build {
            return Err(RemotexError::Driver {
                exit_code,
                output: "! LaTeX Error: File `missing.sty' not found.".into(),
            });
        }
        let src = tree::read_file(&self.dir(Subdir::Src), "main.tex")?;
        tree::write_file(&self.dir(Subdir::Out), "main.pdf", &src)?;
        tree::write_file(&self.dir(Subdir::Aux), "main.log", b"log")?;
        Ok("Output written on main.pdf".into())
    }
}

fn sorted_paths(files: &[FileRecord]) -> Vec<String> {
    let mut paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
    paths.sort();
    paths
}

fn sorted(mut files: Vec<FileRecord>) -> Vec<FileRecord> {
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

#[tokio::test]
async fn push_into_empty_remote_uploads_everything() {
    let local = tempfile::tempdir().unwrap();
    let server = tempfile::tempdir().unwrap();
    let remote = DirRemote::new(server.path());

    let src = local.path().join("src");
    tree::write_file(&src, "a.tex", b"0123456789").unwrap();
    tree::write_file(&src, "img/fig.png", &[7u8; 500]).unwrap();

    let report = push(local.path(), Subdir::Src, &remote).await.unwrap();
    assert_eq!(sorted_paths(&report.diff.added), vec!["a.tex", "img/fig.png"]);
    assert!(report.diff.removed.is_empty());
    assert_eq!(
        sorted(remote.manifest(Subdir::Src)),
        sorted(scan_manifest(&src).unwrap().manifest)
    );
}

#[tokio::test]
async fn pull_removes_stale_and_prunes_parents() {
    let local = tempfile::tempdir().unwrap();
    let server = tempfile::tempdir().unwrap();
    let remote = DirRemote::new(server.path());

    let src = local.path().join("src");
    tree::write_file(&src, "chapters/old.tex", b"old").unwrap();
    tree::write_file(&remote.dir(Subdir::Src), "new.tex", b"new").unwrap();

    let report = pull(local.path(), Subdir::Src, &remote).await.unwrap();
    assert_eq!(sorted_paths(&report.diff.removed), vec!["chapters/old.tex"]);
    assert_eq!(sorted_paths(&report.diff.added), vec!["new.tex"]);
    assert!(!src.join("chapters/old.tex").exists());
    assert!(!src.join("chapters").exists());
    assert_eq!(std::fs::read(src.join("new.tex")).unwrap(), b"new");
}

#[tokio::test]
async fn push_then_pull_converges_and_is_idempotent() {
    let local = tempfile::tempdir().unwrap();
    let server = tempfile::tempdir().unwrap();
    let remote = DirRemote::new(server.path());

    let src = local.path().join("src");
    tree::write_file(&src, "main.tex", b"\\documentclass{article}").unwrap();
    tree::write_file(&src, "sec/one.tex", b"one").unwrap();
    tree::write_file(&remote.dir(Subdir::Src), "stale.tex", b"stale").unwrap();
    tree::write_file(&remote.dir(Subdir::Src), "main.tex", b"outdated").unwrap();

    let first = push(local.path(), Subdir::Src, &remote).await.unwrap();
    assert_eq!(sorted_paths(&first.diff.removed), vec!["main.tex", "stale.tex"]);
    assert_eq!(remote.uploads.load(Ordering::SeqCst), 2);

    let pulled = pull(local.path(), Subdir::Src, &remote).await.unwrap();
    assert!(pulled.diff.is_empty());

    let again = push(local.path(), Subdir::Src, &remote).await.unwrap();
    assert!(again.diff.is_empty());
    assert_eq!(again.diff.same.len(), 2);
    // unchanged files are never re-sent
    assert_eq!(remote.uploads.load(Ordering::SeqCst), 2);
    assert_eq!(remote.downloads.load(Ordering::SeqCst), 0);

    let local_manifest = sorted(scan_manifest(&src).unwrap().manifest);
    assert!(diff(&local_manifest, &remote.manifest(Subdir::Src)).is_empty());
}

#[tokio::test]
async fn build_and_sync_round_trip() {
    let local = tempfile::tempdir().unwrap();
    let server = tempfile::tempdir().unwrap();
    let remote = DirRemote::new(server.path());
    tree::write_file(&local.path().join("src"), "main.tex", b"%PDF-ish").unwrap();

    let report = build_and_sync(local.path(), &remote, &BuildOptions::default(), false)
        .await
        .unwrap();
    assert_eq!(report.output, "Output written on main.pdf");
    assert_eq!(report.pulled.len(), 1);
    assert_eq!(
        std::fs::read(local.path().join("out/main.pdf")).unwrap(),
        b"%PDF-ish"
    );
    assert!(!local.path().join("aux/main.log").exists());

    build_and_sync(local.path(), &remote, &BuildOptions::default(), true)
        .await
        .unwrap();
    assert!(local.path().join("aux/main.log").exists());
}

#[tokio::test]
async fn failed_build_returns_driver_output_and_pulls_nothing() {
    let local = tempfile::tempdir().unwrap();
    let server = tempfile::tempdir().unwrap();
    let mut remote = DirRemote::new(server.path());
    remote.fail_build = Some(12);
    tree::write_file(&local.path().join("src"), "main.tex", b"x").unwrap();

    let err = build_and_sync(local.path(), &remote, &BuildOptions::default(), false)
        .await
        .unwrap_err();
    match err {
        RemotexError::Driver { exit_code, output } => {
            assert_eq!(exit_code, 12);
            assert!(output.contains("missing.sty"));
        }
        other => panic!("expected driver error, got {other:?}"),
    }
    assert!(!local.path().join("out").exists());
}

#[tokio::test]
async fn clone_materializes_src_and_out() {
    let server = tempfile::tempdir().unwrap();
    let remote = DirRemote::new(server.path());
    tree::write_file(&remote.dir(Subdir::Src), "main.tex", b"src").unwrap();
    tree::write_file(&remote.dir(Subdir::Out), "main.pdf", b"pdf").unwrap();
    tree::write_file(&remote.dir(Subdir::Aux), "main.aux", b"aux").unwrap();

    let parent = tempfile::tempdir().unwrap();
    let target = parent.path().join("thesis");
    let reports = clone_into(&target, &remote, false).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(target.join("src/main.tex").exists());
    assert!(target.join("out/main.pdf").exists());
    assert!(target.join("aux").is_dir());
    assert!(!target.join("aux/main.aux").exists());

    // refuses to clobber an existing directory
    assert!(clone_into(&target, &remote, false).await.is_err());
}
