pub mod catalog;
pub mod doctor;
pub mod reference;
pub mod region;

use std::path::PathBuf;

pub use catalog::{LayoutCatalog, LayoutFile};
pub use reference::ReferenceMap;
pub use region::{Region, RegionStore};

/// Layout problems. Always raised while loading, never during frame processing.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("region {id}: {reason}")]
    InvalidRegion { id: u32, reason: String },

    #[error("duplicate region id {0}")]
    DuplicateRegion(u32),

    #[error("read layout {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse layout {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("encode layout {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
}
