//! Filesystem confinement for staging and cleanup.
//!
//! Every path is resolved (symlinks followed, `..` collapsed by the kernel
//! where the path exists) before it is compared against the root, so a
//! lexically harmless path that escapes through a link is still rejected.

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::SandboxError;

type Result<T> = std::result::Result<T, SandboxError>;

/// A filesystem subtree that staging and cleanup operations are confined to.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Open (creating if needed) the sandbox rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| SandboxError::io(root, e))?;
        let canonical = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| SandboxError::io(root, e))?;
        if canonical.parent().is_none() {
            return Err(SandboxError::unsafe_path(
                canonical,
                "filesystem root cannot be a sandbox root",
            ));
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, target: &Path) -> PathBuf {
        if target.is_absolute() {
            target.to_path_buf()
        } else {
            self.root.join(target)
        }
    }

    /// Resolve `target` and return it only if it lies strictly inside the root.
    ///
    /// Relative paths are taken relative to the root.
    pub fn confine_dir(&self, target: impl AsRef<Path>) -> Result<PathBuf> {
        let target = target.as_ref();
        let absolute = self.absolute(target);
        let resolved = resolve(&absolute).map_err(|e| SandboxError::io(target, e))?;

        if resolved.parent().is_none() {
            return Err(SandboxError::unsafe_path(resolved, "filesystem root"));
        }
        if resolved == self.root {
            return Err(SandboxError::unsafe_path(resolved, "sandbox root itself"));
        }
        if !resolved.starts_with(&self.root) {
            return Err(SandboxError::unsafe_path(
                resolved,
                format!("outside sandbox root {}", self.root.display()),
            ));
        }
        Ok(resolved)
    }

    /// Like [`Sandbox::confine_dir`], additionally rejecting existing directories.
    pub fn confine_file(&self, target: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = self.confine_dir(target)?;
        match std::fs::metadata(&resolved) {
            Ok(meta) if meta.is_dir() => {
                Err(SandboxError::unsafe_path(resolved, "expected a file, found a directory"))
            }
            Ok(_) => Ok(resolved),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(resolved),
            Err(e) => Err(SandboxError::io(resolved, e)),
        }
    }

    /// Recursively create a directory inside the sandbox.
    pub async fn create_dir(&self, target: impl AsRef<Path>) -> Result<PathBuf> {
        let resolved = self.confine_dir(target)?;
        tokio::fs::create_dir_all(&resolved)
            .await
            .map_err(|e| SandboxError::io(&resolved, e))?;
        Ok(resolved)
    }

    /// Recursively remove a directory inside the sandbox. Missing is not an error.
    pub async fn remove_dir(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = self.absolute(target.as_ref());
        if !exists(&target).await {
            return Ok(());
        }
        let resolved = self.confine_dir(target)?;
        match tokio::fs::remove_dir_all(&resolved).await {
            Ok(()) => {
                debug!(path = %resolved.display(), "removed directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::io(resolved, e)),
        }
    }

    /// Remove a single file inside the sandbox. Missing is not an error.
    pub async fn remove_file(&self, target: impl AsRef<Path>) -> Result<()> {
        let target = self.absolute(target.as_ref());
        if !exists(&target).await {
            return Ok(());
        }
        let resolved = self.confine_file(target)?;
        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => {
                debug!(path = %resolved.display(), "removed file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::io(resolved, e)),
        }
    }

    /// Blocking variant of the removals, for use from `Drop`.
    pub(crate) fn remove_blocking(&self, target: &Path, is_dir: bool) -> Result<()> {
        let target = self.absolute(target);
        if std::fs::symlink_metadata(&target).is_err() {
            return Ok(());
        }
        let result = if is_dir {
            let resolved = self.confine_dir(&target)?;
            std::fs::remove_dir_all(&resolved).map_err(|e| (resolved, e))
        } else {
            let resolved = self.confine_file(&target)?;
            std::fs::remove_file(&resolved).map_err(|e| (resolved, e))
        };
        match result {
            Ok(()) => Ok(()),
            Err((_, e)) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err((path, e)) => Err(SandboxError::io(path, e)),
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

/// Canonicalize the longest existing prefix of `path`, then append the rest.
///
/// The non-existing remainder cannot contain symlinks, so collapsing its `.`
/// and `..` components lexically is exact.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<Component<'_>> = Vec::new();
    let components: Vec<Component<'_>> = path.components().collect();
    let mut split = components.len();

    while std::fs::symlink_metadata(&existing).is_err() {
        if !existing.pop() || split == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no existing ancestor for {}", path.display()),
            ));
        }
        split -= 1;
    }
    remainder.extend_from_slice(&components[split..]);

    let mut resolved = std::fs::canonicalize(&existing)?;
    for component in remainder {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(resolved)
}
