//! Static asset registry
//!
//! Prebuilt SDK artifacts are shared, immutable inputs to many test pages.
//! The registry holds one canonical copy of each and links it into build
//! output directories, so repeated builds never recompile or duplicate
//! unchanged bundles. Writers only write when the target does not yet
//! exist; a concurrent `AlreadyExists` is benign since the content is
//! identical either way.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone)]
pub struct AssetRegistry {
    root: PathBuf,
}

impl AssetRegistry {
    pub fn new(root: impl Into<PathBuf>) -> HarnessResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    /// Register the canonical copy of an artifact. If it already exists it
    /// is left untouched (write-if-absent).
    pub fn publish(&self, name: &str, bytes: &[u8]) -> HarnessResult<PathBuf> {
        let path = self.path_of(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes)?;
                debug!(artifact = name, "published asset");
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(path),
            Err(e) => Err(HarnessError::Asset(format!(
                "failed to publish {}: {}",
                name, e
            ))),
        }
    }

    /// Link the canonical artifact into a build output directory. No-op if
    /// the target already exists.
    pub fn link_into(&self, dir: &Path, name: &str) -> HarnessResult<PathBuf> {
        let source = self.path_of(name);
        if !source.is_file() {
            return Err(HarnessError::Asset(format!(
                "artifact {:?} is not in the registry at {}",
                name,
                self.root.display()
            )));
        }

        let target = dir.join(name);
        if target.exists() {
            return Ok(target);
        }

        match link_or_copy(&source, &target) {
            Ok(()) => Ok(target),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(target),
            Err(e) => Err(HarnessError::Asset(format!(
                "failed to link {} into {}: {}",
                name,
                dir.display(),
                e
            ))),
        }
    }

    /// Names of all registered artifacts.
    pub fn artifacts(&self) -> Vec<String> {
        WalkDir::new(&self.root)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect()
    }
}

#[cfg(unix)]
fn link_or_copy(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
fn link_or_copy(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::copy(source, target).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_is_write_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AssetRegistry::new(dir.path().join("assets")).unwrap();

        registry.publish("bundle.es5.js", b"first").unwrap();
        registry.publish("bundle.es5.js", b"second").unwrap();

        let content = std::fs::read(registry.path_of("bundle.es5.js")).unwrap();
        assert_eq!(content, b"first");
    }

    #[test]
    fn link_into_creates_once_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AssetRegistry::new(dir.path().join("assets")).unwrap();
        registry.publish("sdk.esm.js", b"export const x = 1;").unwrap();

        let out = dir.path().join("page");
        std::fs::create_dir_all(&out).unwrap();

        let first = registry.link_into(&out, "sdk.esm.js").unwrap();
        let second = registry.link_into(&out, "sdk.esm.js").unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"export const x = 1;");
    }

    #[test]
    fn linking_an_unregistered_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AssetRegistry::new(dir.path().join("assets")).unwrap();
        let err = registry
            .link_into(dir.path(), "bundle.replay.js")
            .unwrap_err();
        assert!(matches!(err, HarnessError::Asset(_)));
    }

    #[test]
    fn artifacts_lists_registered_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AssetRegistry::new(dir.path().join("assets")).unwrap();
        registry.publish("a.js", b"a").unwrap();
        registry.publish("b.js", b"b").unwrap();

        let mut names = registry.artifacts();
        names.sort();
        assert_eq!(names, vec!["a.js".to_string(), "b.js".to_string()]);
    }
}
