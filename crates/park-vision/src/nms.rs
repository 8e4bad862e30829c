use crate::DetectionBox;

pub fn iou(a: &DetectionBox, b: &DetectionBox) -> f32 {
    let ix_a = a.x.max(b.x);
    let iy_a = a.y.max(b.y);
    let ix_b = (a.x + a.width).min(b.x + b.width);
    let iy_b = (a.y + a.height).min(b.y + b.height);

    let inter = (ix_b - ix_a).max(0.0) * (iy_b - iy_a).max(0.0);
    let area_a = a.width.max(0.0) * a.height.max(0.0);
    let area_b = b.width.max(0.0) * b.height.max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}
