use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Writes `contents` to `path` through a sibling temp file and an atomic
/// rename, so readers observe either the old file or the complete new one.
///
/// Parent directories are created as needed. On Unix the file is created
/// with mode `0600` since it may hold key material or bearer tokens.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let (dir, tmp) = temp_sibling(path)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let result = write_new(&tmp, contents).and_then(|()| {
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename into {}", path.display()))
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Like [`write_atomic`] but never replaces an existing file: the complete
/// temp file is hard-linked into place, which fails if `path` exists.
///
/// Returns `Ok(false)` without touching `path` when it already exists.
pub fn create_atomic(path: &Path, contents: &[u8]) -> Result<bool> {
    let (dir, tmp) = temp_sibling(path)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let result = write_new(&tmp, contents).and_then(|()| match std::fs::hard_link(&tmp, path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to link into {}", path.display())),
    });
    let _ = std::fs::remove_file(&tmp);
    result
}

fn temp_sibling(path: &Path) -> Result<(&Path, std::path::PathBuf)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid file path {}", path.display()))?;
    let tmp = dir.join(format!(".{file_name}.{:08x}.tmp", rand::random::<u32>()));
    Ok((dir, tmp))
}

fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_missing_parent_when_writing_then_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn given_existing_file_when_writing_then_contents_are_replaced_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.pem");
        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn given_existing_file_when_creating_then_it_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.cfg");
        assert!(create_atomic(&path, b"first").unwrap());
        assert!(!create_atomic(&path, b"second").unwrap());

        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
