//! File-system facade for the HLS muxer: segment files go either to disk or
//! to an in-memory map, selected once per handle.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

pub mod errors;

use errors::FsLayerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsKind {
    #[default]
    Disk,
    Memory,
}

pub trait FileSystemLayer: Send + Sync {
    fn kind(&self) -> FsKind;
    fn read_file(&self, path: &Path) -> FsLayerResult<Vec<u8>>;
    fn write_file(&self, path: &Path, data: &[u8]) -> FsLayerResult<()>;
    fn remove_all(&self, path: &Path) -> FsLayerResult<()>;
}

#[derive(Debug, Default)]
pub struct DiskFs;

impl FileSystemLayer for DiskFs {
    fn kind(&self) -> FsKind {
        FsKind::Disk
    }

    fn read_file(&self, path: &Path) -> FsLayerResult<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> FsLayerResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(fs::write(path, data)?)
    }

    fn remove_all(&self, path: &Path) -> FsLayerResult<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps whole segment files in a map. Paths are used verbatim as keys, and
/// `remove_all` drops every entry under the given prefix.
#[derive(Debug, Default)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl FileSystemLayer for MemFs {
    fn kind(&self) -> FsKind {
        FsKind::Memory
    }

    fn read_file(&self, path: &Path) -> FsLayerResult<Vec<u8>> {
        self.files
            .lock()
            .expect("mem fs lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| errors::FsLayerError::NotFound(path.to_path_buf()))
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> FsLayerResult<()> {
        self.files
            .lock()
            .expect("mem fs lock poisoned")
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> FsLayerResult<()> {
        self.files
            .lock()
            .expect("mem fs lock poisoned")
            .retain(|k, _| !k.starts_with(path));
        Ok(())
    }
}

/// Per-handle selector with one-shot semantics: the first `select` decides
/// the backend, later calls are silently ignored. Reading through a handle
/// that was never selected uses the disk backend.
pub struct FsSelector {
    layer: OnceLock<Box<dyn FileSystemLayer>>,
}

impl FsSelector {
    pub fn new() -> Self {
        Self {
            layer: OnceLock::new(),
        }
    }

    pub fn select(&self, kind: FsKind) {
        let res = self.layer.set(match kind {
            FsKind::Disk => Box::new(DiskFs),
            FsKind::Memory => Box::new(MemFs::default()),
        });
        if res.is_err() {
            tracing::warn!(
                "fs layer already selected as {:?}, ignoring re-selection to {:?}",
                self.layer().kind(),
                kind
            );
        }
    }

    pub fn layer(&self) -> &dyn FileSystemLayer {
        self.layer.get_or_init(|| Box::new(DiskFs)).as_ref()
    }
}

impl Default for FsSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{FileSystemLayer, FsKind, FsSelector, MemFs, errors::FsLayerError};

    #[test]
    fn test_selection_is_one_shot() {
        let selector = FsSelector::new();
        selector.select(FsKind::Memory);
        selector.select(FsKind::Disk);
        assert_eq!(selector.layer().kind(), FsKind::Memory);
    }

    #[test]
    fn test_unselected_handle_defaults_to_disk() {
        let selector = FsSelector::new();
        assert_eq!(selector.layer().kind(), FsKind::Disk);
        // reading through the handle pins the default, selection no longer applies
        selector.select(FsKind::Memory);
        assert_eq!(selector.layer().kind(), FsKind::Disk);
    }

    #[test]
    fn test_mem_fs_write_read_remove() {
        let fs = MemFs::default();
        let seg = Path::new("/hls/test/0.ts");
        fs.write_file(seg, b"segment").unwrap();
        assert_eq!(fs.read_file(seg).unwrap(), b"segment");

        fs.remove_all(Path::new("/hls/test")).unwrap();
        assert!(matches!(
            fs.read_file(seg),
            Err(FsLayerError::NotFound(_))
        ));
    }
}
