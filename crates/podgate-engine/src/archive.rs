//! Single-file tar archives for injecting content into a container.
//!
//! Engines accept file uploads as tar streams extracted at `/`, so a
//! destination like `/etc/app/config.toml` becomes the archive entry
//! `etc/app/config.toml`.

use crate::EngineError;
use std::io::Read;
use std::path::{Component, Path};

/// Turn an absolute or relative destination into a tar entry path.
///
/// Rejects empty paths, paths ending in `/`, and any `..` component.
pub fn entry_path(dest_path: &str) -> Result<String, EngineError> {
    let trimmed = dest_path.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        return Err(EngineError::InvalidPath(dest_path.to_owned()));
    }
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(EngineError::InvalidPath(dest_path.to_owned())),
        }
    }
    Ok(trimmed.to_owned())
}

pub fn single_file_archive(dest_path: &str, content: &[u8]) -> Result<Vec<u8>, EngineError> {
    let path = entry_path(dest_path)?;

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_size(content.len() as u64);
    header.set_cksum();

    let mut ar = tar::Builder::new(Vec::new());
    ar.append_data(&mut header, &path, content)?;
    Ok(ar.into_inner()?)
}

/// Read every regular file out of an archive as `(entry_path, bytes)`.
pub fn read_files(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>, EngineError> {
    let mut ar = tar::Archive::new(data);
    let mut files = Vec::new();
    for entry in ar.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        files.push((path, content));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_path_strips_leading_slash() {
        assert_eq!(entry_path("/etc/motd").unwrap(), "etc/motd");
        assert_eq!(entry_path("tmp/a.txt").unwrap(), "tmp/a.txt");
    }

    #[test]
    fn entry_path_rejects_traversal() {
        assert!(entry_path("/etc/../../root/.ssh/keys").is_err());
        assert!(entry_path("..").is_err());
    }

    #[test]
    fn entry_path_rejects_empty_and_directories() {
        assert!(entry_path("").is_err());
        assert!(entry_path("/").is_err());
        assert!(entry_path("/tmp/").is_err());
    }

    #[test]
    fn archive_preserves_exact_bytes() {
        let content = "line one\n\ttabbed é ✓\r\nno trailing newline".as_bytes();
        let data = single_file_archive("/srv/note.txt", content).unwrap();
        let files = read_files(&data).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "srv/note.txt");
        assert_eq!(files[0].1, content);
    }

    #[test]
    fn archive_of_empty_file() {
        let data = single_file_archive("/empty", b"").unwrap();
        let files = read_files(&data).unwrap();
        assert_eq!(files, vec![("empty".to_owned(), Vec::new())]);
    }
}
