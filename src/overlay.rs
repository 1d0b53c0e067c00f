//! Overlay PNG compositing: draws each detected layout element's bbox in
//! its fixed class color over the normalized raster, plus a yellow gutter
//! band for split spreads (spec §4.7 "Artifacts").
//!
//! Grounded on the teacher's `pipeline::encode` PNG-writing idiom;
//! `imageproc::drawing` supplies the filled-rectangle primitive in place
//! of the teacher's base64 PNG payload construction.

use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::model::{Box4, LayoutElement, SpreadSide};

const GUTTER_COLOR: Rgba<u8> = Rgba([0xea, 0xb3, 0x08, 0xa0]);
const STROKE_ALPHA: u8 = 0xd0;
const FILL_ALPHA: u8 = 0x30;

fn clamp_rect(bbox: Box4, width: u32, height: u32) -> Option<Rect> {
    let [x0, y0, x1, y1] = bbox;
    let x0 = x0.clamp(0, width as i64 - 1) as i32;
    let y0 = y0.clamp(0, height as i64 - 1) as i32;
    let x1 = x1.clamp(x0 as i64, width as i64 - 1) as i32;
    let y1 = y1.clamp(y0 as i64, height as i64 - 1) as i32;
    let w = (x1 - x0 + 1).max(1) as u32;
    let h = (y1 - y0 + 1).max(1) as u32;
    Some(Rect::at(x0, y0).of_size(w, h))
}

/// Scales a bbox recorded against `from_size` (the pre-resize crop) into
/// the coordinate space of `to_size` (the post-resize canonical raster),
/// using independent per-axis ratios. Spec §9 open question (c): this is
/// an approximation under non-isotropic aspect drift, kept deliberately
/// rather than replaced with a different projection.
pub fn rescale_bbox(bbox: Box4, from_size: (u32, u32), to_size: (u32, u32)) -> Box4 {
    let (fw, fh) = (from_size.0.max(1) as f64, from_size.1.max(1) as f64);
    let (tw, th) = (to_size.0 as f64, to_size.1 as f64);
    let rx = tw / fw;
    let ry = th / fh;
    [
        (bbox[0] as f64 * rx).round() as i64,
        (bbox[1] as f64 * ry).round() as i64,
        (bbox[2] as f64 * rx).round() as i64,
        (bbox[3] as f64 * ry).round() as i64,
    ]
}

/// Composites element bboxes (each in the class's fixed color, per
/// `ElementType::overlay_color`) and, if present, a yellow gutter band
/// over a copy of `base`.
pub fn build_overlay(
    base: &DynamicImage,
    elements: &[LayoutElement],
    gutter: Option<(SpreadSide, Box4)>,
) -> RgbaImage {
    let mut canvas = base.to_rgba8();
    let (width, height) = (canvas.width(), canvas.height());

    for element in elements {
        let Some(rect) = clamp_rect(element.bbox, width, height) else { continue };
        let (r, g, b) = element.element_type.overlay_color();
        draw_filled_rect_mut(&mut canvas, rect, Rgba([r, g, b, FILL_ALPHA]));
        draw_hollow_rect_mut(&mut canvas, rect, Rgba([r, g, b, STROKE_ALPHA]));
    }

    if let Some((_side, gutter_box)) = gutter {
        if let Some(rect) = clamp_rect(gutter_box, width, height) {
            draw_filled_rect_mut(&mut canvas, rect, GUTTER_COLOR);
        }
    }

    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementSource, ElementType};
    use image::Rgb;

    fn blank(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::from_pixel(width, height, Rgb([250, 250, 250])))
    }

    #[test]
    fn overlay_tints_the_element_bbox() {
        let base = blank(100, 100);
        let elements = vec![LayoutElement {
            id: "e1".into(),
            element_type: ElementType::TextBlock,
            bbox: [10, 10, 40, 40],
            confidence: 0.9,
            source: ElementSource::Local,
            flags: vec![],
            text: None,
            notes: None,
        }];
        let overlay = build_overlay(&base, &elements, None);
        let pixel = overlay.get_pixel(20, 20);
        assert_ne!(pixel.0, [250, 250, 250, 255]);
    }

    #[test]
    fn rescale_bbox_applies_independent_axis_ratios() {
        let scaled = rescale_bbox([10, 20, 30, 40], (100, 200), (200, 100));
        assert_eq!(scaled, [20, 10, 60, 20]);
    }

    #[test]
    fn overlay_draws_gutter_band_when_present() {
        let base = blank(100, 100);
        let overlay = build_overlay(&base, &[], Some((SpreadSide::Left, [45, 0, 55, 99])));
        let pixel = overlay.get_pixel(50, 50);
        assert_eq!(pixel.0, GUTTER_COLOR.0);
    }
}
