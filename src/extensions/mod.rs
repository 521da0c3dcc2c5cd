//! Extension Syncer (C7): packages a user's skills/agents/commands/hooks/
//! knowledge directories into a deterministic tar stream that C2 copies
//! into a freshly created container's `.claude` configuration root.
//!
//! Built on the same `tar` crate idiom used elsewhere for deterministic
//! archive construction; compression and zip support have no use here — the
//! bundle is copied straight into the container, never stored or transferred.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// Directories synced into every container, relative to both the host
/// extensions root and the container's `.claude` directory.
const SYNCED_DIRECTORIES: [&str; 5] = ["skills", "agents", "commands", "hooks", "knowledge"];

/// Files inside `hooks/` get the executable bit set in the archive so they
/// run without a manual `chmod` once unpacked in the container.
const EXECUTABLE_DIRECTORY: &str = "hooks";

pub struct ExtensionSyncer {
    /// Host directory holding the per-user extension tree:
    /// `<extensions_root>/user_<id>/{skills,agents,commands,hooks,knowledge}`.
    extensions_root: PathBuf,
}

impl ExtensionSyncer {
    pub fn new(extensions_root: PathBuf) -> Self {
        Self { extensions_root }
    }

    /// Builds the tar archive for `user_id`. Returns `Ok(None)` when the
    /// user has no extension tree at all — a sync failure is never fatal
    /// to container creation, so callers treat `None` the same as an
    /// `Err` they chose to log and ignore.
    pub fn build_archive(&self, user_id: &str) -> ExtensionResult<Option<Vec<u8>>> {
        let user_root = self.extensions_root.join(format!("user_{user_id}"));
        if !user_root.exists() {
            return Ok(None);
        }

        let mut builder = tar::Builder::new(Vec::new());
        // Deterministic archives: same directory tree always produces
        // identical bytes, directories visited in a fixed order.
        for dir_name in SYNCED_DIRECTORIES {
            let dir_path = user_root.join(dir_name);
            if !dir_path.is_dir() {
                continue;
            }
            self.append_directory(&mut builder, &dir_path, dir_name, dir_name == EXECUTABLE_DIRECTORY)?;
        }

        let bytes = builder.into_inner()?;
        Ok(Some(bytes))
    }

    fn append_directory<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        dir_path: &Path,
        archive_prefix: &str,
        executable: bool,
    ) -> ExtensionResult<()> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir_path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for entry in entries {
            let file_name = entry.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
            let archive_path = format!("{archive_prefix}/{file_name}");

            if entry.is_dir() {
                self.append_directory(builder, &entry, &archive_path, executable)?;
                continue;
            }

            let mut header = tar::Header::new_gnu();
            let data = std::fs::read(&entry)?;
            header.set_size(data.len() as u64);
            header.set_mode(if executable { 0o755 } else { 0o644 });
            header.set_mtime(0);
            header.set_cksum();

            builder.append_data(&mut header, &archive_path, data.as_slice())?;
        }

        Ok(())
    }
}

/// Non-fatal wrapper used by C2: logs and swallows failures so a broken
/// extension tree never blocks container creation.
pub fn try_sync(syncer: &ExtensionSyncer, user_id: &str) -> Option<Vec<u8>> {
    match syncer.build_archive(user_id) {
        Ok(archive) => archive,
        Err(e) => {
            warn!("extension sync failed for user {}: {}", user_id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn builds_archive_with_executable_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let user_root = tmp.path().join("user_u1");
        fs::create_dir_all(user_root.join("hooks")).unwrap();
        fs::write(user_root.join("hooks/pre_commit.sh"), b"#!/bin/sh\necho hi").unwrap();
        fs::create_dir_all(user_root.join("skills")).unwrap();
        fs::write(user_root.join("skills/readme.md"), b"# skill").unwrap();

        let syncer = ExtensionSyncer::new(tmp.path().to_path_buf());
        let archive = syncer.build_archive("u1").unwrap().expect("archive present");

        let mut ar = tar::Archive::new(archive.as_slice());
        let mut paths: Vec<(String, u32)> = ar
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let path = e.path().unwrap().to_string_lossy().to_string();
                let mode = e.header().mode().unwrap();
                (path, mode)
            })
            .collect();
        paths.sort();

        assert!(paths.iter().any(|(p, mode)| p == "hooks/pre_commit.sh" && *mode == 0o755));
        assert!(paths.iter().any(|(p, _)| p == "skills/readme.md"));
    }

    #[test]
    fn missing_user_tree_yields_none() {
        let tmp = tempfile::tempdir().unwrap();
        let syncer = ExtensionSyncer::new(tmp.path().to_path_buf());
        assert!(syncer.build_archive("ghost").unwrap().is_none());
    }
}
