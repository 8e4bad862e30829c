use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_REFERENCE: &str = "carParkImg.png";
pub const DEFAULT_DIMENSIONS: (u32, u32) = (1280, 720);

const BUILTIN_SOURCES: &[(&str, &str)] = &[
    ("sample5.mp4", "saming1.png"),
    ("Video.mp4", "videoImg.png"),
    ("carPark.mp4", "carParkImg.png"),
    ("0", "webcamImg.png"),
    ("newVideo1.mp4", "newRefImage1.png"),
    ("newVideo2.mp4", "newRefImage2.png"),
];

const BUILTIN_DIMENSIONS: &[(&str, (u32, u32))] = &[
    ("carParkImg.png", (1280, 720)),
    ("videoImg.png", (1280, 720)),
    ("webcamImg.png", (640, 480)),
    ("newRefImage1.png", (1280, 720)),
    ("newRefImage2.png", (1920, 1080)),
];

/// Maps video sources to the reference image whose layout applies to them.
#[derive(Debug, Clone)]
pub struct ReferenceMap {
    sources: BTreeMap<String, String>,
    dimensions: BTreeMap<String, (u32, u32)>,
    default_reference: String,
}

impl Default for ReferenceMap {
    fn default() -> Self {
        Self {
            sources: BUILTIN_SOURCES.iter().map(|(s, r)| (s.to_string(), r.to_string())).collect(),
            dimensions: BUILTIN_DIMENSIONS.iter().map(|(r, d)| (r.to_string(), *d)).collect(),
            default_reference: DEFAULT_REFERENCE.to_string(),
        }
    }
}

impl ReferenceMap {
    /// Builtin table extended (or overridden) by configured entries.
    pub fn with_overrides(
        sources: &BTreeMap<String, String>,
        dimensions: &BTreeMap<String, [u32; 2]>,
        default_reference: Option<&str>,
    ) -> Self {
        let mut map = Self::default();
        map.sources.extend(sources.iter().map(|(k, v)| (k.clone(), v.clone())));
        map.dimensions.extend(dimensions.iter().map(|(k, [w, h])| (k.clone(), (*w, *h))));
        if let Some(r) = default_reference {
            map.default_reference = r.to_string();
        }
        map
    }

    /// Exact identifier first, then its file name, then the default reference.
    pub fn reference_for(&self, source: &str) -> &str {
        if let Some(r) = self.sources.get(source) {
            return r;
        }
        let file_name = Path::new(source).file_name().and_then(|f| f.to_str());
        if let Some(r) = file_name.and_then(|f| self.sources.get(f)) {
            return r;
        }
        &self.default_reference
    }

    pub fn dimensions(&self, reference: &str) -> (u32, u32) {
        self.dimensions.get(reference).copied().unwrap_or(DEFAULT_DIMENSIONS)
    }

    pub fn default_reference(&self) -> &str {
        &self.default_reference
    }

    /// All distinct references named by the table, default included.
    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.sources.values().cloned().collect();
        refs.push(self.default_reference.clone());
        refs.sort();
        refs.dedup();
        refs
    }
}
