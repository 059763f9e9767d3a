use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::{Error, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

pub fn backup_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

pub fn backup_dir_name(name: &str, timestamp: &str) -> String {
    format!("{name}_{timestamp}")
}

pub fn backup_destination(destination: &Path, name: &str, timestamp: &str) -> PathBuf {
    destination.join(backup_dir_name(name, timestamp))
}

/// Recursively copies `source` into `dest`, creating directories as needed and
/// overwriting files that already exist. Symlinks are followed and their
/// targets copied; link cycles, dangling links and special files are errors.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<CopyStats> {
    if !source.is_dir() {
        return Err(Error::Copy {
            message: format!("source is not a directory: {}", source.display()),
        });
    }

    std::fs::create_dir_all(dest).map_err(|e| copy_error(dest, e))?;

    let mut stats = CopyStats::default();
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|e| Error::Copy {
            message: format!("walk failed: {e}"),
        })?;
        let path = entry.path();
        if path == source {
            continue;
        }

        let rel = path.strip_prefix(source).map_err(|_| Error::Copy {
            message: "path strip_prefix failed".to_string(),
        })?;
        let target = dest.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| copy_error(&target, e))?;
            stats.dirs += 1;
        } else if file_type.is_file() {
            let bytes = std::fs::copy(path, &target).map_err(|e| copy_error(path, e))?;
            stats.files += 1;
            stats.bytes += bytes;
        } else {
            return Err(Error::Copy {
                message: format!("unsupported file type: {}", path.display()),
            });
        }
    }
    Ok(stats)
}

fn copy_error(path: &Path, e: std::io::Error) -> Error {
    Error::Copy {
        message: format!("{}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: PathBuf, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn copy_preserves_relative_paths_and_contents() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src");
        write_file(source.join("package.json"), b"{\"name\":\"foo\"}");
        write_file(source.join("Runtime/nested/a.cs"), &[7u8; 4096]);
        std::fs::create_dir_all(source.join("Empty")).unwrap();

        let dest = temp.path().join("out/nightly_2024-01-01-00-00");
        let stats = copy_tree(&source, &dest).unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 14 + 4096);
        assert!(dest.join("Empty").is_dir());
        assert_eq!(
            std::fs::read(dest.join("Runtime/nested/a.cs")).unwrap(),
            vec![7u8; 4096]
        );
        assert_eq!(
            std::fs::read(dest.join("package.json")).unwrap(),
            b"{\"name\":\"foo\"}"
        );
    }

    #[test]
    fn copy_overwrites_existing_files() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src");
        write_file(source.join("a.txt"), b"new");
        let dest = temp.path().join("dest");
        write_file(dest.join("a.txt"), b"old contents");

        copy_tree(&source, &dest).unwrap();
        assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_entries_are_copied_through() {
        use std::os::unix::fs::symlink;

        let temp = tempfile::tempdir().unwrap();
        let outside = temp.path().join("outside");
        write_file(outside.join("shared.txt"), b"shared");
        write_file(outside.join("lib/util.cs"), b"class Util {}");

        let source = temp.path().join("src");
        write_file(source.join("a.txt"), b"a");
        symlink(outside.join("shared.txt"), source.join("link.txt")).unwrap();
        symlink(outside.join("lib"), source.join("LinkedLib")).unwrap();

        let dest = temp.path().join("dest");
        let stats = copy_tree(&source, &dest).unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(std::fs::read(dest.join("link.txt")).unwrap(), b"shared");
        assert!(dest.join("LinkedLib").is_dir());
        assert_eq!(
            std::fs::read(dest.join("LinkedLib/util.cs")).unwrap(),
            b"class Util {}"
        );
        assert!(!std::fs::symlink_metadata(dest.join("link.txt"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_fails_the_copy() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src");
        write_file(source.join("a.txt"), b"a");
        std::os::unix::fs::symlink(temp.path().join("gone"), source.join("broken")).unwrap();

        let err = copy_tree(&source, &temp.path().join("dest")).unwrap_err();
        assert!(matches!(err, Error::Copy { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycle_fails_the_copy() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src");
        write_file(source.join("nested/a.txt"), b"a");
        std::os::unix::fs::symlink(&source, source.join("nested/loop")).unwrap();

        let err = copy_tree(&source, &temp.path().join("dest")).unwrap_err();
        assert!(matches!(err, Error::Copy { .. }));
    }

    #[test]
    fn missing_source_is_a_copy_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = copy_tree(&temp.path().join("missing"), &temp.path().join("d")).unwrap_err();
        assert!(matches!(err, Error::Copy { .. }));
    }

    #[test]
    fn destination_names_are_timestamped_siblings() {
        let base = Path::new("/tmp/out");
        let first = backup_destination(base, "nightly", "2024-01-01-00-00");
        let second = backup_destination(base, "nightly", "2024-01-01-00-01");
        assert_eq!(first, PathBuf::from("/tmp/out/nightly_2024-01-01-00-00"));
        assert_ne!(first, second);
        assert_eq!(first.parent(), second.parent());
    }

    #[test]
    fn timestamp_matches_format() {
        let ts = backup_timestamp();
        let parsed =
            chrono::NaiveDateTime::parse_from_str(&format!("{ts}-00"), "%Y-%m-%d-%H-%M-%S");
        assert!(parsed.is_ok(), "unexpected timestamp: {ts}");
    }
}
