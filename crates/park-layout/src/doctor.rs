use crate::{LayoutError, LayoutFile, ReferenceMap, RegionStore};

/// Hard failures come back as `Err`; findings worth a look come back as warnings.
pub fn check_layout(file: &LayoutFile, references: &ReferenceMap) -> Result<Vec<String>, LayoutError> {
    let store = RegionStore::new(file.reference.clone(), file.regions.clone())?;
    let (ref_w, ref_h) = match (file.width, file.height) {
        (Some(w), Some(h)) => (w, h),
        _ => references.dimensions(&file.reference),
    };

    let mut warnings = Vec::new();
    if store.is_empty() {
        warnings.push(format!("{}: no parking spaces defined", file.reference));
    }

    for r in store.regions() {
        match r.clamp_to(ref_w, ref_h) {
            None => warnings.push(format!("region {} lies outside {}x{}", r.id, ref_w, ref_h)),
            Some(c) if c.width() as i32 != r.width || c.height() as i32 != r.height => {
                warnings.push(format!("region {} is clipped by the {}x{} frame", r.id, ref_w, ref_h))
            }
            Some(_) => {}
        }
    }

    let regions = store.regions();
    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            if a.overlaps(b) {
                warnings.push(format!("regions {} and {} overlap", a.id, b.id));
            }
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Region;

    #[test]
    fn clean_layout_has_no_warnings() {
        let file = LayoutFile {
            reference: "webcamImg.png".into(),
            width: None,
            height: None,
            regions: vec![Region::new(0, 0, 0, 100, 50), Region::new(1, 100, 0, 100, 50)],
        };
        assert!(check_layout(&file, &ReferenceMap::default()).unwrap().is_empty());
    }

    #[test]
    fn reports_clipping_and_overlap() {
        let file = LayoutFile {
            reference: "webcamImg.png".into(),
            width: None,
            height: None,
            regions: vec![
                Region::new(0, 600, 0, 100, 50),
                Region::new(1, 620, 10, 10, 10),
                Region::new(2, 700, 500, 10, 10),
            ],
        };
        let warnings = check_layout(&file, &ReferenceMap::default()).unwrap();
        assert!(warnings.iter().any(|w| w.contains("region 0 is clipped")));
        assert!(warnings.iter().any(|w| w.contains("regions 0 and 1 overlap")));
        assert!(warnings.iter().any(|w| w.contains("region 2 lies outside")));
    }

    #[test]
    fn invalid_geometry_is_an_error() {
        let mut file = LayoutFile::empty("lot.png");
        file.regions.push(Region::new(9, 0, 0, 5, 0));
        assert!(check_layout(&file, &ReferenceMap::default()).is_err());
    }
}
