use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use remotex_state::{ContentDigest, FileRecord};
use tracing::{debug, warn};

use crate::domain::{RemotexError, Result};

/// Directories that are never descended into.
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// A file the scan could not turn into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

/// Outcome of scanning one subdir root.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub manifest: Vec<FileRecord>,
    pub skipped: Vec<SkippedFile>,
}

enum Entry {
    Record(FileRecord),
    Skipped(SkippedFile),
}

/// Recursively list every regular file under `root` with its size and
/// SHA-256.
///
/// Paths are relative to `root` and `/`-separated. Symlinks, special files
/// and unreadable files are reported in `skipped`. A missing or unreadable
/// root fails the whole scan.
pub fn scan_manifest(root: &Path) -> Result<ScanReport> {
    let meta = fs::metadata(root).map_err(|e| {
        RemotexError::internal(format!("cannot scan {}: {e}", root.display()))
    })?;
    if !meta.is_dir() {
        return Err(RemotexError::internal(format!(
            "cannot scan {}: not a directory",
            root.display()
        )));
    }

    let mut report = ScanReport::default();
    walk(root, "", &mut report, true)?;
    debug!(
        root = %root.display(),
        files = report.manifest.len(),
        skipped = report.skipped.len(),
        "scanned manifest"
    );
    Ok(report)
}

fn walk(dir: &Path, prefix: &str, report: &mut ScanReport, is_root: bool) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if is_root => {
            return Err(RemotexError::internal(format!(
                "cannot read {}: {e}",
                dir.display()
            )))
        }
        Err(e) => {
            skip(report, prefix.trim_end_matches('/'), format!("unreadable directory: {e}"));
            return Ok(());
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                skip(report, prefix.trim_end_matches('/'), format!("directory entry: {e}"));
                continue;
            }
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            skip(
                report,
                &format!("{prefix}{}", name.to_string_lossy()),
                "file name is not valid UTF-8".to_string(),
            );
            continue;
        };
        let rel = format!("{prefix}{name}");

        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(e) => {
                skip(report, &rel, format!("cannot stat: {e}"));
                continue;
            }
        };

        if file_type.is_dir() {
            if VCS_DIRS.contains(&name) {
                continue;
            }
            walk(&entry.path(), &format!("{rel}/"), report, false)?;
        } else if file_type.is_symlink() {
            skip(report, &rel, "symbolic link".to_string());
        } else if file_type.is_file() {
            match hash_file(&entry.path(), rel) {
                Entry::Record(record) => report.manifest.push(record),
                Entry::Skipped(skipped) => {
                    warn!(path = %skipped.path, reason = %skipped.reason, "skipping file");
                    report.skipped.push(skipped);
                }
            }
        } else {
            skip(report, &rel, "not a regular file".to_string());
        }
    }
    Ok(())
}

fn hash_file(path: &Path, rel: String) -> Entry {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            return Entry::Skipped(SkippedFile {
                path: rel,
                reason: format!("cannot open: {e}"),
            })
        }
    };
    match ContentDigest::from_reader(BufReader::new(file)) {
        Ok((digest, size)) => Entry::Record(FileRecord::new(rel, size, digest)),
        Err(e) => Entry::Skipped(SkippedFile {
            path: rel,
            reason: format!("read failed: {e}"),
        }),
    }
}

fn skip(report: &mut ScanReport, path: &str, reason: String) {
    debug!(path, reason = %reason, "skipping entry");
    report.skipped.push(SkippedFile {
        path: path.to_string(),
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_nested_files_with_slash_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("chapters/one")).unwrap();
        fs::write(dir.path().join("main.tex"), b"\\input{chapters/one/intro}").unwrap();
        fs::write(dir.path().join("chapters/one/intro.tex"), b"hello").unwrap();

        let mut report = scan_manifest(dir.path()).unwrap();
        report.manifest.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(report.manifest.len(), 2);
        assert_eq!(report.manifest[0].path, "chapters/one/intro.tex");
        assert_eq!(report.manifest[0].size, 5);
        assert_eq!(
            report.manifest[0].digest,
            ContentDigest::from_bytes(b"hello")
        );
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn skips_vcs_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), b"ref").unwrap();
        fs::write(dir.path().join("a.tex"), b"a").unwrap();

        let report = scan_manifest(dir.path()).unwrap();
        assert_eq!(report.manifest.len(), 1);
        assert_eq!(report.manifest[0].path, "a.tex");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_reported_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.tex"), b"x").unwrap();
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("leak.tex")).unwrap();

        let report = scan_manifest(dir.path()).unwrap();
        assert_eq!(report.manifest.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].path, "leak.tex");
    }

    #[test]
    fn empty_file_hashes_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty"), b"").unwrap();
        let report = scan_manifest(dir.path()).unwrap();
        assert_eq!(report.manifest[0].size, 0);
        assert_eq!(report.manifest[0].digest, ContentDigest::from_bytes(b""));
    }

    #[test]
    fn missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_manifest(&dir.path().join("nope")).is_err());
    }
}
