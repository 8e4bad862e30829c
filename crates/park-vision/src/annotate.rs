//! Display overlay. Drawing never fails; shapes are clipped to the frame.

use image::Rgb;
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use park_layout::Region;

use crate::{DetectionBox, Frame, OccupancyResult, TrackedPoint};

pub const FREE: Rgb<u8> = Rgb([0, 200, 0]);
pub const OCCUPIED: Rgb<u8> = Rgb([255, 0, 0]);
pub const LINE: Rgb<u8> = Rgb([255, 127, 0]);
pub const POINT: Rgb<u8> = Rgb([0, 255, 255]);
pub const ML_BOX: Rgb<u8> = Rgb([255, 0, 255]);

fn to_i32(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Outline of `[x0, x1) x [y0, y1)`, `thickness` pixels inward.
pub fn draw_rect(frame: &mut Frame, x0: i64, y0: i64, x1: i64, y1: i64, thickness: i64, color: Rgb<u8>) {
    let (w, h) = (i64::from(frame.width()), i64::from(frame.height()));
    for t in 0..thickness {
        // edges beyond -1 or past the far border are invisible either way
        let (ax, ay) = ((x0 + t).max(-1), (y0 + t).max(-1));
        let (bx, by) = ((x1 - t).min(w + 1), (y1 - t).min(h + 1));
        if bx <= ax || by <= ay {
            break;
        }
        let rect = Rect::at(to_i32(ax), to_i32(ay)).of_size((bx - ax) as u32, (by - ay) as u32);
        draw_hollow_rect_mut(frame, rect, color);
    }
}

pub fn hline(frame: &mut Frame, y: i64, thickness: i64, color: Rgb<u8>) {
    if frame.width() == 0 {
        return;
    }
    let top = (y - thickness / 2).clamp(-1, i64::from(frame.height()) + 1);
    let rect = Rect::at(0, to_i32(top)).of_size(frame.width(), thickness.clamp(1, 64) as u32);
    draw_filled_rect_mut(frame, rect, color);
}

pub fn marker(frame: &mut Frame, cx: f32, cy: f32, radius: i64, color: Rgb<u8>) {
    draw_filled_circle_mut(frame, (cx.round() as i32, cy.round() as i32), to_i32(radius), color);
}

/// Region outlines coloured by the pass results; regions without a result stay free-coloured.
pub fn regions(frame: &mut Frame, regions: &[Region], results: &[OccupancyResult]) {
    for r in regions {
        let occupied = results.iter().any(|o| o.region_id == r.id && o.occupied);
        let (x, y) = (i64::from(r.x), i64::from(r.y));
        let (x1, y1) = (x + i64::from(r.width), y + i64::from(r.height));
        draw_rect(frame, x, y, x1, y1, 2, if occupied { OCCUPIED } else { FREE });
    }
}

pub fn counting_line(frame: &mut Frame, line_height: i32) {
    hline(frame, i64::from(line_height), 2, LINE);
}

pub fn points(frame: &mut Frame, points: &[TrackedPoint]) {
    for p in points {
        marker(frame, p.x, p.y, 3, POINT);
    }
}

pub fn boxes(frame: &mut Frame, boxes: &[DetectionBox]) {
    for b in boxes {
        let (x0, y0) = (b.x.round() as i64, b.y.round() as i64);
        let (x1, y1) = ((b.x + b.width).round() as i64, (b.y + b.height).round() as i64);
        draw_rect(frame, x0, y0, x1, y1, 1, ML_BOX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_colour_follows_occupancy() {
        let mut frame = Frame::new(40, 20);
        let rs = [Region::new(1, 0, 0, 10, 10), Region::new(2, 20, 0, 10, 10)];
        let results = [
            OccupancyResult { region_id: 1, occupied: true, pixel_count: 900 },
            OccupancyResult { region_id: 2, occupied: false, pixel_count: 0 },
        ];
        regions(&mut frame, &rs, &results);
        assert_eq!(*frame.get_pixel(0, 0), OCCUPIED);
        assert_eq!(*frame.get_pixel(20, 5), FREE);
        // interior untouched
        assert_eq!(*frame.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn shapes_outside_the_frame_are_clipped() {
        let mut frame = Frame::new(8, 8);
        draw_rect(&mut frame, -5, -5, 20, 20, 2, FREE);
        marker(&mut frame, -1.0, 9.0, 3, POINT);
        hline(&mut frame, 100, 2, LINE);
        hline(&mut frame, 7, 2, LINE);
        assert_eq!(*frame.get_pixel(3, 7), LINE);
        draw_rect(&mut frame, i64::from(i32::MIN) * 4, 0, i64::from(i32::MAX) * 4, 4, 1, OCCUPIED);
        assert_eq!(*frame.get_pixel(2, 0), OCCUPIED);
        assert_eq!(*frame.get_pixel(2, 3), OCCUPIED);
    }

    #[test]
    fn thick_outline_grows_inward() {
        let mut frame = Frame::new(20, 20);
        draw_rect(&mut frame, 2, 2, 12, 12, 2, FREE);
        assert_eq!(*frame.get_pixel(2, 5), FREE);
        assert_eq!(*frame.get_pixel(3, 5), FREE);
        assert_eq!(*frame.get_pixel(4, 5), Rgb([0, 0, 0]));
        assert_eq!(*frame.get_pixel(11, 11), FREE);
        assert_eq!(*frame.get_pixel(12, 12), Rgb([0, 0, 0]));
    }

    #[test]
    fn marker_is_a_filled_disc() {
        let mut frame = Frame::new(20, 20);
        marker(&mut frame, 10.2, 9.8, 3, POINT);
        assert_eq!(*frame.get_pixel(10, 10), POINT);
        assert_eq!(*frame.get_pixel(13, 10), POINT);
        assert_eq!(*frame.get_pixel(15, 10), Rgb([0, 0, 0]));
    }
}
