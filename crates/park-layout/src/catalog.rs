use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{LayoutError, ReferenceMap, Region, RegionStore};

/// On-disk layout: one TOML file per reference image.
///
/// ```toml
/// reference = "carParkImg.png"
/// width = 1280
/// height = 720
///
/// [[regions]]
/// id = 0
/// x = 45
/// y = 140
/// width = 107
/// height = 48
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutFile {
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub regions: Vec<Region>,
}

impl LayoutFile {
    pub fn empty(reference: impl Into<String>) -> Self {
        Self { reference: reference.into(), width: None, height: None, regions: Vec::new() }
    }
}

/// Directory of layout files plus the source -> reference table.
#[derive(Debug, Clone)]
pub struct LayoutCatalog {
    dir: PathBuf,
    references: ReferenceMap,
}

impl LayoutCatalog {
    pub fn new(dir: impl Into<PathBuf>, references: ReferenceMap) -> Self {
        Self { dir: dir.into(), references }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn references(&self) -> &ReferenceMap {
        &self.references
    }

    /// `carParkImg.png` is stored as `<dir>/carParkImg.toml`.
    pub fn path_for(&self, reference: &str) -> PathBuf {
        let stem = Path::new(reference)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(reference);
        self.dir.join(format!("{stem}.toml"))
    }

    /// Raw layout file, `None` when no file exists yet.
    pub fn read(&self, reference: &str) -> Result<Option<LayoutFile>, LayoutError> {
        let path = self.path_for(reference);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LayoutError::Io { path, source }),
        };
        let file: LayoutFile = toml::from_str(&text).map_err(|source| LayoutError::Parse { path, source })?;
        Ok(Some(file))
    }

    /// Validated regions for `layout_id` (a reference image name).
    ///
    /// A missing file yields an empty layout so a fresh install can start
    /// before any space has been marked.
    pub fn load(&self, layout_id: &str) -> Result<RegionStore, LayoutError> {
        match self.read(layout_id)? {
            Some(file) => {
                debug!("layout: {} regions for {}", file.regions.len(), layout_id);
                RegionStore::new(layout_id, file.regions)
            }
            None => {
                warn!("layout: no file for {} at {}", layout_id, self.path_for(layout_id).display());
                Ok(RegionStore::empty(layout_id))
            }
        }
    }

    /// Layout applying to a video source identifier.
    pub fn load_for_source(&self, source: &str) -> Result<RegionStore, LayoutError> {
        self.load(self.references.reference_for(source))
    }

    pub fn save(&self, layout: &LayoutFile) -> Result<PathBuf, LayoutError> {
        RegionStore::new(layout.reference.clone(), layout.regions.clone())?;
        let path = self.path_for(&layout.reference);
        let text = toml::to_string_pretty(layout).map_err(|source| LayoutError::Encode { path: path.clone(), source })?;
        std::fs::create_dir_all(&self.dir).map_err(|source| LayoutError::Io { path: self.dir.clone(), source })?;
        std::fs::write(&path, text).map_err(|source| LayoutError::Io { path: path.clone(), source })?;
        Ok(path)
    }
}
