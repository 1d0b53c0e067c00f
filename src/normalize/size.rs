//! Physical-size inference (spec §4.4 "Physical-size inference").

use crate::model::DimensionSource;

/// Common paper sizes in millimeters, `(width, height)` in portrait
/// orientation. Landscape is tried as the transposed pair.
const COMMON_PAPER_SIZES_MM: &[(&str, f64, f64)] = &[
    ("A3", 297.0, 420.0),
    ("A4", 210.0, 297.0),
    ("A5", 148.0, 210.0),
    ("B5", 176.0, 250.0),
    ("Letter", 215.9, 279.4),
];

#[derive(Debug, Clone, Copy)]
pub struct PhysicalSize {
    pub width_mm: f64,
    pub height_mm: f64,
    pub dpi: f64,
    pub source: DimensionSource,
}

/// Scans the first PNG `pHYs` chunk or JPEG JFIF `APP0` segment for an
/// embedded pixel density, returned in DPI (pixels per inch).
pub fn embedded_dpi(bytes: &[u8]) -> Option<f64> {
    if bytes.len() > 8 && &bytes[0..8] == b"\x89PNG\r\n\x1a\n" {
        return png_phys_dpi(bytes);
    }
    if bytes.len() > 4 && bytes[0] == 0xFF && bytes[1] == 0xD8 {
        return jfif_dpi(bytes);
    }
    None
}

fn png_phys_dpi(bytes: &[u8]) -> Option<f64> {
    let mut i = 8;
    while i + 8 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]) as usize;
        let kind = &bytes[i + 4..i + 8];
        if kind == b"pHYs" && i + 8 + 9 <= bytes.len() {
            let data = &bytes[i + 8..i + 8 + 9];
            let ppu_x = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let unit = data[8];
            if unit == 1 && ppu_x > 0 {
                // pixels per meter -> DPI
                return Some(ppu_x as f64 * 0.0254);
            }
            return None;
        }
        if kind == b"IDAT" {
            return None;
        }
        i += 8 + len + 4; // length + type + data + CRC
    }
    None
}

fn jfif_dpi(bytes: &[u8]) -> Option<f64> {
    let mut i = 2;
    while i + 4 <= bytes.len() {
        if bytes[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = bytes[i + 1];
        if marker == 0xD8 || marker == 0xD9 || (0xD0..=0xD7).contains(&marker) {
            i += 2;
            continue;
        }
        if i + 4 > bytes.len() {
            break;
        }
        let seg_len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
        if marker == 0xE0 && seg_len >= 14 && i + 2 + seg_len <= bytes.len() {
            let seg = &bytes[i + 4..i + 2 + seg_len];
            if seg.len() >= 12 && &seg[0..5] == b"JFIF\0" {
                let units = seg[7];
                let x_density = u16::from_be_bytes([seg[8], seg[9]]);
                return match units {
                    1 => Some(x_density as f64),       // dots per inch
                    2 => Some(x_density as f64 * 2.54), // dots per cm -> dpi
                    _ => None,
                };
            }
        }
        if marker == 0xDA {
            break;
        }
        i += 2 + seg_len;
    }
    None
}

fn aspect_drift(a: f64, b: f64) -> f64 {
    if b.abs() < f64::EPSILON {
        return f64::MAX;
    }
    ((a - b) / b).abs()
}

/// Resolves the physical size of a page in the priority order spec §4.4
/// lays out: embedded metadata density, then target dims + DPI, then the
/// closest common paper size, then a DPI/mm fallback.
pub fn infer_physical_size(
    width_px: u32,
    height_px: u32,
    raw_bytes: &[u8],
    target_width_mm: f64,
    target_height_mm: f64,
    target_dpi: f64,
    fallback_dpi: f64,
) -> PhysicalSize {
    let target_aspect = target_width_mm / target_height_mm;
    let px_aspect = width_px as f64 / height_px as f64;

    if let Some(dpi) = embedded_dpi(raw_bytes) {
        if dpi >= 1.0 {
            let width_mm = width_px as f64 / dpi * 25.4;
            let height_mm = height_px as f64 / dpi * 25.4;
            let drift = aspect_drift(width_mm / height_mm, target_aspect);
            if drift < 0.05 {
                return PhysicalSize {
                    width_mm,
                    height_mm,
                    dpi,
                    source: DimensionSource::Metadata,
                };
            }
        }
    }

    {
        let width_mm = width_px as f64 / target_dpi * 25.4;
        let height_mm = height_px as f64 / target_dpi * 25.4;
        let drift = aspect_drift(width_mm / height_mm, target_aspect);
        if drift < 0.05 {
            return PhysicalSize {
                width_mm,
                height_mm,
                dpi: target_dpi,
                source: DimensionSource::Inferred,
            };
        }
    }

    if let Some((w_mm, h_mm)) = closest_common_paper_size(px_aspect) {
        let dpi = (width_px as f64 / w_mm * 25.4 + height_px as f64 / h_mm * 25.4) / 2.0;
        return PhysicalSize {
            width_mm: w_mm,
            height_mm: h_mm,
            dpi,
            source: DimensionSource::Inferred,
        };
    }

    PhysicalSize {
        width_mm: width_px as f64 / fallback_dpi * 25.4,
        height_mm: height_px as f64 / fallback_dpi * 25.4,
        dpi: fallback_dpi,
        source: DimensionSource::Fallback,
    }
}

/// Finds the common paper size whose aspect ratio is closest to
/// `px_aspect`, trying both orientations, returning `None` if the
/// closest candidate's aspect distance is `>= 0.02`.
fn closest_common_paper_size(px_aspect: f64) -> Option<(f64, f64)> {
    let mut best: Option<((f64, f64), f64)> = None;
    for &(_, w, h) in COMMON_PAPER_SIZES_MM {
        for &(cw, ch) in &[(w, h), (h, w)] {
            let candidate_aspect = cw / ch;
            let distance = (candidate_aspect - px_aspect).abs();
            if best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some(((cw, ch), distance));
            }
        }
    }
    best.and_then(|(size, distance)| if distance < 0.02 { Some(size) } else { None })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_when_nothing_else_matches() {
        let size = infer_physical_size(999, 777, &[], 210.0, 297.0, 300.0, 150.0);
        assert_eq!(size.source, DimensionSource::Fallback);
        assert!((size.dpi - 150.0).abs() < 1e-9);
    }

    #[test]
    fn uses_target_dims_when_aspect_matches() {
        // 2480x3507 px at 300 dpi is ~210x297mm (A4) within drift.
        let size = infer_physical_size(2480, 3507, &[], 210.0, 297.0, 300.0, 150.0);
        assert_eq!(size.source, DimensionSource::Inferred);
        assert!((size.dpi - 300.0).abs() < 2.0);
    }

    #[test]
    fn falls_to_common_paper_size_for_a5_aspect_with_mismatched_target() {
        // A5-ish pixel aspect but a target far from A4/A5 aspect (square target).
        let size = infer_physical_size(1240, 1754, &[], 200.0, 200.0, 300.0, 150.0);
        assert!(matches!(size.source, DimensionSource::Inferred | DimensionSource::Fallback));
    }

    #[test]
    fn png_phys_chunk_is_parsed() {
        // Build a minimal PNG with a pHYs chunk of 300 dpi (11811 ppm).
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        // IHDR (not strictly valid contents, just a placeholder length+type+crc)
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&[0u8; 13]);
        bytes.extend_from_slice(&[0u8; 4]); // fake CRC
        // pHYs: 9 bytes payload, 11811 ppm both axes, unit=1 (meter)
        bytes.extend_from_slice(&9u32.to_be_bytes());
        bytes.extend_from_slice(b"pHYs");
        bytes.extend_from_slice(&11811u32.to_be_bytes());
        bytes.extend_from_slice(&11811u32.to_be_bytes());
        bytes.push(1);
        bytes.extend_from_slice(&[0u8; 4]); // fake CRC

        let dpi = png_phys_dpi(&bytes).expect("should parse pHYs");
        assert!((dpi - 300.0).abs() < 1.0, "dpi={dpi}");
    }
}
