//! Workspace filesystem bridge
//!
//! Maps a bounded virtual directory tree onto durable host storage. Every
//! path coming from callers or sandboxed code is normalized, joined to the
//! host root, and canonicalized before any I/O happens. Resolution runs
//! again on every access, so a symlink written by an earlier execution is
//! re-checked at the moment it is dereferenced rather than trusted from a
//! prior verdict.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Virtual root exposed to sandboxed code.
pub const DEFAULT_VIRTUAL_ROOT: &str = "/workspace";

/// Errors that can occur during workspace filesystem operations
#[derive(Debug, Error)]
pub enum FsError {
    /// Path resolves outside the workspace root
    #[error("security violation: {0} resolves outside the workspace")]
    SecurityViolation(String),
    /// File or directory not found
    #[error("file not found: {0}")]
    NotFound(String),
    /// Path is not a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// Path is not a file
    #[error("not a file: {0}")]
    NotAFile(String),
    /// Directory still has entries
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    /// Invalid path format
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory entry returned by listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name
    pub name: String,
    /// Whether this entry is a directory
    pub is_dir: bool,
    /// Size in bytes (0 for directories on some platforms)
    pub size: u64,
}

/// Bounded view of host storage shared by both interpreters and the caller.
///
/// Accepted path spellings all map into the root: workspace-relative
/// (`data/x.txt`), virtual-absolute (`/workspace/data/x.txt`), and
/// bare-absolute (`/data/x.txt`). `..` segments that would climb above the
/// root are rejected outright.
#[derive(Debug)]
pub struct Workspace {
    /// Canonical host root; everything must resolve underneath it.
    root: PathBuf,
    virtual_root: String,
}

impl Workspace {
    /// Open (creating if needed) a workspace rooted at `root` on the host.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, FsError> {
        Self::create_with_virtual_root(root, DEFAULT_VIRTUAL_ROOT).await
    }

    /// Open a workspace with a custom virtual root path.
    pub async fn create_with_virtual_root(
        root: impl Into<PathBuf>,
        virtual_root: &str,
    ) -> Result<Self, FsError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        if virtual_root.is_empty() || !virtual_root.starts_with('/') {
            return Err(FsError::InvalidPath(format!(
                "virtual root must be absolute: {virtual_root}"
            )));
        }
        Ok(Self {
            root,
            virtual_root: virtual_root.trim_end_matches('/').to_string(),
        })
    }

    /// The virtual root path sandboxed code sees (e.g. `/workspace`).
    pub fn virtual_root(&self) -> &str {
        &self.virtual_root
    }

    /// The canonical host directory backing the workspace.
    pub fn host_root(&self) -> &Path {
        &self.root
    }

    /// Normalize a virtual path to a relative path under the root.
    ///
    /// Purely lexical: strips the virtual-root prefix or a leading `/`,
    /// drops `.` segments, and folds `..` without ever leaving the root.
    fn clean(&self, path: &str) -> Result<PathBuf, FsError> {
        if path.contains('\0') {
            return Err(FsError::InvalidPath(path.replace('\0', "\\0")));
        }

        let rest = if path == self.virtual_root {
            ""
        } else if let Some(rest) = path.strip_prefix(&self.virtual_root)
            && rest.starts_with('/')
        {
            rest
        } else {
            path
        };

        let mut rel = PathBuf::new();
        for segment in rest.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    // Climbing above the root is an escape attempt, not a
                    // path that happens to normalize to the root.
                    if !rel.pop() {
                        tracing::warn!(path, "blocked workspace escape");
                        return Err(FsError::SecurityViolation(path.to_string()));
                    }
                }
                other => rel.push(other),
            }
        }
        Ok(rel)
    }

    /// Virtual path string for a relative path under the root.
    fn virtual_path_of(&self, rel: &Path) -> String {
        let mut out = self.virtual_root.clone();
        for component in rel.components() {
            if let Component::Normal(name) = component {
                out.push('/');
                out.push_str(&name.to_string_lossy());
            }
        }
        out
    }

    /// Canonicalize an existing host path and check containment.
    ///
    /// `original` is the caller-supplied spelling, used in error messages.
    async fn checked(&self, candidate: &Path, original: &str) -> Result<PathBuf, FsError> {
        let canonical = match tokio::fs::canonicalize(candidate).await {
            Ok(canonical) => canonical,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // The entry may still exist as a dangling symlink; that is
                // unresolvable, so it fails closed rather than falling
                // through to creation.
                return match tokio::fs::symlink_metadata(candidate).await {
                    Ok(_) => Err(FsError::SecurityViolation(original.to_string())),
                    Err(_) => Err(FsError::NotFound(original.to_string())),
                };
            }
            Err(err) => return Err(err.into()),
        };
        if !canonical.starts_with(&self.root) {
            tracing::warn!(path = original, "blocked workspace escape");
            return Err(FsError::SecurityViolation(original.to_string()));
        }
        Ok(canonical)
    }

    /// Resolve a virtual path to a canonical host path for an existing entry.
    ///
    /// Fails with [`FsError::SecurityViolation`] whenever the canonical
    /// result lands outside the root, whether via `..`, an absolute path, or
    /// a symlink created by a prior execution.
    pub async fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let rel = self.clean(path)?;
        let candidate = self.root.join(rel);
        self.checked(&candidate, path).await
    }

    /// Resolve a virtual path for creation, validating the deepest existing
    /// ancestor and creating missing parent directories beneath it.
    pub async fn resolve_for_write(&self, path: &str) -> Result<PathBuf, FsError> {
        let rel = self.clean(path)?;
        if rel.as_os_str().is_empty() {
            return Err(FsError::NotAFile(path.to_string()));
        }
        let candidate = self.root.join(&rel);

        // Existing entries (including symlinks) go through full
        // canonicalization so a write through a link is containment-checked.
        match tokio::fs::symlink_metadata(&candidate).await {
            Ok(_) => return self.checked(&candidate, path).await,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        // Walk up to the deepest existing ancestor, canonicalize it, then
        // re-append the not-yet-existing remainder (which cannot contain
        // symlinks precisely because it does not exist).
        let mut ancestor = self.root.as_path();
        for parent in candidate.ancestors().skip(1) {
            match tokio::fs::symlink_metadata(parent).await {
                Ok(_) => {
                    ancestor = parent;
                    break;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        let canonical_ancestor = self.checked(ancestor, path).await?;
        if !tokio::fs::metadata(&canonical_ancestor).await?.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        let remainder = candidate
            .strip_prefix(ancestor)
            .map_err(|_| FsError::InvalidPath(path.to_string()))?;
        let full = canonical_ancestor.join(remainder);
        if let Some(parent) = full.parent()
            && parent != canonical_ancestor
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(full)
    }

    /// Validate that a virtual path names an existing directory inside the
    /// workspace, returning its normalized virtual form.
    pub async fn resolve_dir(&self, path: &str) -> Result<String, FsError> {
        let rel = self.clean(path)?;
        let candidate = self.root.join(&rel);
        let canonical = self.checked(&candidate, path).await?;
        if !tokio::fs::metadata(&canonical).await?.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        Ok(self.virtual_path_of(&rel))
    }

    /// Read a file as text (invalid UTF-8 replaced).
    pub async fn read(&self, path: &str) -> Result<String, FsError> {
        let host = self.resolve(path).await?;
        if tokio::fs::metadata(&host).await?.is_dir() {
            return Err(FsError::NotAFile(path.to_string()));
        }
        let bytes = tokio::fs::read(&host).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write text to a file, creating parent directories as needed.
    pub async fn write(&self, path: &str, content: &str) -> Result<(), FsError> {
        let host = self.resolve_for_write(path).await?;
        if let Ok(meta) = tokio::fs::metadata(&host).await
            && meta.is_dir()
        {
            return Err(FsError::NotAFile(path.to_string()));
        }
        tokio::fs::write(&host, content.as_bytes()).await?;
        Ok(())
    }

    /// List a directory (the workspace root when `path` is `None`),
    /// sorted by name so repeated listings compare equal.
    pub async fn list(&self, path: Option<&str>) -> Result<Vec<FileEntry>, FsError> {
        let path = path.unwrap_or("");
        let host = self.resolve(path).await?;
        if !tokio::fs::metadata(&host).await?.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&host).await?;
        while let Some(entry) = dir.next_entry().await? {
            // DirEntry::metadata does not traverse symlinks, so an escaping
            // link shows up as a plain entry without touching its target.
            let meta = entry.metadata().await?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: meta.is_dir(),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Delete a file, symlink, or empty directory.
    ///
    /// Non-empty directories fail with [`FsError::DirectoryNotEmpty`]
    /// rather than recursing.
    pub async fn delete(&self, path: &str) -> Result<(), FsError> {
        let rel = self.clean(path)?;
        if rel.as_os_str().is_empty() {
            return Err(FsError::InvalidPath("cannot delete workspace root".to_string()));
        }
        let candidate = self.root.join(&rel);
        let canonical = self.checked(&candidate, path).await?;

        // Deleting a symlink removes the link itself, never its target.
        let lexical_meta = tokio::fs::symlink_metadata(&candidate).await?;
        if lexical_meta.file_type().is_symlink() {
            tokio::fs::remove_file(&candidate).await?;
            return Ok(());
        }

        if canonical == self.root {
            return Err(FsError::InvalidPath("cannot delete workspace root".to_string()));
        }
        if lexical_meta.is_dir() {
            tokio::fs::remove_dir(&canonical).await.map_err(|err| {
                if err.kind() == ErrorKind::DirectoryNotEmpty {
                    FsError::DirectoryNotEmpty(path.to_string())
                } else {
                    err.into()
                }
            })?;
        } else {
            tokio::fs::remove_file(&canonical).await?;
        }
        Ok(())
    }
}
