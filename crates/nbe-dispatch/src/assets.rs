//! Static asset publication for deployed application versions.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use walkdir::WalkDir;

/// Why a static tree could not be copied.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// Source or destination is not an absolute path.
    #[error("asset paths must be absolute: {0}")]
    RelativePath(PathBuf),
    /// The destination lies inside the source tree.
    #[error("destination {dst} is inside source {src}")]
    NestedDestination {
        /// Copy destination.
        dst: PathBuf,
        /// Copy source.
        src: PathBuf,
    },
    /// The source directory does not exist.
    #[error("asset source {0} does not exist")]
    MissingSource(PathBuf),
    /// Reading or writing a file failed.
    #[error("copying {path}: {source}")]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Walking the source tree failed.
    #[error("walking asset tree: {0}")]
    Walk(#[from] walkdir::Error),
    /// The blocking copy task panicked or was cancelled.
    #[error("asset copy task failed: {0}")]
    Join(String),
}

/// Copies a built asset tree to where the reverse proxy serves it.
#[async_trait]
pub trait StaticAssets: Send + Sync {
    /// Recursively copy `src` into `dst`, creating directories as needed and
    /// overwriting existing files. Returns the number of files copied.
    async fn copy_tree(&self, dst: &Path, src: &Path) -> Result<u64, AssetError>;
}

/// [`StaticAssets`] on the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStaticAssets;

#[async_trait]
impl StaticAssets for FsStaticAssets {
    async fn copy_tree(&self, dst: &Path, src: &Path) -> Result<u64, AssetError> {
        let (dst, src) = (dst.to_path_buf(), src.to_path_buf());
        tokio::task::spawn_blocking(move || copy_dir(&dst, &src))
            .await
            .map_err(|e| AssetError::Join(e.to_string()))?
    }
}

fn copy_dir(dst: &Path, src: &Path) -> Result<u64, AssetError> {
    for path in [dst, src] {
        if !path.is_absolute() {
            return Err(AssetError::RelativePath(path.to_path_buf()));
        }
    }
    if dst.starts_with(src) {
        return Err(AssetError::NestedDestination {
            dst: dst.to_path_buf(),
            src: src.to_path_buf(),
        });
    }
    if !src.is_dir() {
        return Err(AssetError::MissingSource(src.to_path_buf()));
    }

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| AssetError::Io { path, source }
    };

    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            let _ = std::fs::copy(entry.path(), &target).map_err(io_err(entry.path()))?;
            copied += 1;
        }
    }
    debug!(src = %src.display(), dst = %dst.display(), copied, "static assets copied");
    Ok(copied)
}

/// Where an application version's assets come from and go to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticLayout {
    /// Root served by the proxy.
    pub static_dir: PathBuf,
    /// Root of the built assets.
    pub static_src_dir: PathBuf,
}

impl StaticLayout {
    /// Build a layout from the two roots.
    pub fn new(static_dir: impl Into<PathBuf>, static_src_dir: impl Into<PathBuf>) -> Self {
        Self {
            static_dir: static_dir.into(),
            static_src_dir: static_src_dir.into(),
        }
    }

    /// `{static_dir}/{name}_static/{version}`
    pub fn destination(&self, name: &str, version: &str) -> PathBuf {
        self.static_dir.join(format!("{name}_static")).join(version)
    }

    /// `{static_src_dir}/{name}/{version}`
    pub fn source(&self, name: &str, version: &str) -> PathBuf {
        self.static_src_dir.join(name).join(version)
    }
}
