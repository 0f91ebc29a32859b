use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path escapes storage root: {0}")]
    InvalidPath(String),
    #[error("io error on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Blob storage addressed by paths relative to the store's root.
pub trait BlobStore: Send + Sync {
    fn root(&self) -> &Path;
    fn exists(&self, relative: &str) -> bool;
    fn delete(&self, relative: &str) -> StorageResult<()>;
    fn make_directory(&self, relative: &str) -> StorageResult<()>;
    /// Absolute location the encoder reads from or writes to.
    fn path_for_reading(&self, relative: &str) -> StorageResult<PathBuf>;
    fn size(&self, relative: &str) -> StorageResult<u64>;
    fn public_url(&self, relative: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct LocalDiskStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalDiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    pub fn with_public_base_url(mut self, base: Option<String>) -> Self {
        self.public_base_url = base.map(|url| url.trim_end_matches('/').to_string());
        self
    }

    fn resolve(&self, relative: &str) -> StorageResult<PathBuf> {
        let trimmed = relative.trim_start_matches('/');
        let candidate = Path::new(trimmed);
        let escapes = candidate.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        if escapes {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(candidate))
    }
}

impl BlobStore for LocalDiskStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn exists(&self, relative: &str) -> bool {
        self.resolve(relative)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn delete(&self, relative: &str) -> StorageResult<()> {
        let path = self.resolve(relative)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { source, path }),
        }
    }

    fn make_directory(&self, relative: &str) -> StorageResult<()> {
        let path = self.resolve(relative)?;
        std::fs::create_dir_all(&path).map_err(|source| StorageError::Io { source, path })
    }

    fn path_for_reading(&self, relative: &str) -> StorageResult<PathBuf> {
        self.resolve(relative)
    }

    fn size(&self, relative: &str) -> StorageResult<u64> {
        let path = self.resolve(relative)?;
        std::fs::metadata(&path)
            .map(|meta| meta.len())
            .map_err(|source| StorageError::Io { source, path })
    }

    fn public_url(&self, relative: &str) -> Option<String> {
        let base = self.public_base_url.as_ref()?;
        Some(format!("{base}/{}", relative.trim_start_matches('/')))
    }
}

/// Where an uploaded source was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    /// The argument itself named an existing file.
    Raw,
    /// Found under the configured base directory.
    BaseDir,
    /// Found under the source root at this index.
    Root(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub requested: String,
    pub path: PathBuf,
    pub origin: SourceOrigin,
}

#[derive(Debug, Clone)]
pub struct SourceLocator {
    base_dir: PathBuf,
    roots: Vec<PathBuf>,
}

impl SourceLocator {
    pub fn new(base_dir: impl Into<PathBuf>, roots: Vec<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            roots,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Tries the raw argument, then the base directory, then every root in order.
    pub fn locate(&self, requested: &str) -> Option<ResolvedSource> {
        let requested = requested.trim();
        if requested.is_empty() {
            return None;
        }
        let raw = Path::new(requested);
        if raw.is_file() {
            return Some(self.resolved(requested, raw.to_path_buf(), SourceOrigin::Raw));
        }
        let relative = requested.trim_start_matches('/');
        let under_base = self.base_dir.join(relative);
        if under_base.is_file() {
            return Some(self.resolved(requested, under_base, SourceOrigin::BaseDir));
        }
        self.roots.iter().enumerate().find_map(|(index, root)| {
            let candidate = root.join(relative);
            candidate
                .is_file()
                .then(|| self.resolved(requested, candidate, SourceOrigin::Root(index)))
        })
    }

    fn resolved(&self, requested: &str, path: PathBuf, origin: SourceOrigin) -> ResolvedSource {
        debug!(requested, path = %path.display(), ?origin, "resolved transcode source");
        ResolvedSource {
            requested: requested.to_string(),
            path,
            origin,
        }
    }

    /// Deletes the source when it lives inside a source root. Returns whether
    /// a file was removed; refusals and io failures only log.
    pub fn remove_source(&self, source: &ResolvedSource) -> bool {
        let inside_root = match source.origin {
            SourceOrigin::Root(_) => true,
            SourceOrigin::Raw | SourceOrigin::BaseDir => self.is_inside_root(&source.path),
        };
        if !inside_root {
            warn!(
                path = %source.path.display(),
                "source lies outside every source root; leaving it in place"
            );
            return false;
        }
        match std::fs::remove_file(&source.path) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %source.path.display(), error = %err, "failed to delete source");
                false
            }
        }
    }

    fn is_inside_root(&self, path: &Path) -> bool {
        let Ok(canonical) = path.canonicalize() else {
            return false;
        };
        self.roots.iter().any(|root| {
            root.canonicalize()
                .map(|root| canonical.starts_with(root))
                .unwrap_or(false)
        })
    }
}
