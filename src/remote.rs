//! The optional remote layout-inference collaborator (spec §6 "Remote
//! layout interface").
//!
//! This is the one place the pipeline talks to the network. Everything
//! else in the crate is pure local computation; a caller that never
//! configures `remote_layout` never pulls in `reqwest` at runtime (the
//! client is only constructed when a request is made).
//!
//! Grounded on the teacher's `pipeline::input::is_url` endpoint-shape
//! validation and `pipeline::encode`'s PNG+base64 payload construction,
//! generalized from "download one PDF" to "upload one page raster and
//! get layout elements back".

use std::io::Cursor;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

use crate::config::RemoteLayoutConfig;
use crate::error::{Phase, PageError};
use crate::model::{Box4, ElementSource, ElementType, LayoutElement};

/// Request body posted to the remote layout endpoint.
#[derive(Debug, Serialize)]
struct RemoteLayoutRequest {
    #[serde(rename = "pageId")]
    page_id: String,
    width: u32,
    height: u32,
    #[serde(rename = "imageBase64")]
    image_base64: String,
    #[serde(rename = "imageMime")]
    image_mime: &'static str,
}

#[derive(Debug, Deserialize)]
struct RemoteLayoutResponse {
    elements: Vec<RemoteElement>,
}

#[derive(Debug, Deserialize)]
struct RemoteElement {
    #[serde(rename = "type")]
    element_type: String,
    bbox: Box4,
    confidence: f64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

fn parse_element_type(raw: &str) -> Option<ElementType> {
    match raw {
        "page_bounds" => Some(ElementType::PageBounds),
        "text_block" => Some(ElementType::TextBlock),
        "title" => Some(ElementType::Title),
        "running_head" => Some(ElementType::RunningHead),
        "folio" => Some(ElementType::Folio),
        "ornament" => Some(ElementType::Ornament),
        "drop_cap" => Some(ElementType::DropCap),
        "footnote" => Some(ElementType::Footnote),
        "marginalia" => Some(ElementType::Marginalia),
        _ => None,
    }
}

/// Downscales `image` so that neither dimension exceeds `max_dimension_px`
/// and the PNG-encoded payload fits under `max_payload_mb`, halving the
/// scale repeatedly rather than computing an exact target (cheap, and
/// the remote service re-derives precise bboxes anyway).
fn prepare_upload(image: &DynamicImage, max_dimension_px: u32, max_payload_mb: f64) -> (Vec<u8>, u32, u32) {
    let mut candidate = if image.width() > max_dimension_px || image.height() > max_dimension_px {
        image.resize(max_dimension_px, max_dimension_px, FilterType::Lanczos3)
    } else {
        image.clone()
    };

    let max_bytes = (max_payload_mb * 1_048_576.0) as usize;
    loop {
        let mut buf = Vec::new();
        candidate
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .expect("PNG encode of an in-memory raster cannot fail");
        if buf.len() <= max_bytes || candidate.width() <= 64 || candidate.height() <= 64 {
            let (w, h) = candidate.dimensions();
            return (buf, w, h);
        }
        let (w, h) = candidate.dimensions();
        candidate = candidate.resize(w / 2, h / 2, FilterType::Triangle);
    }
}

fn clamp_bbox(bbox: Box4, width: u32, height: u32) -> Box4 {
    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;
    let x0 = bbox[0].clamp(0, max_x);
    let y0 = bbox[1].clamp(0, max_y);
    let x1 = bbox[2].clamp(x0, max_x);
    let y1 = bbox[3].clamp(y0, max_y);
    [x0, y0, x1, y1]
}

/// Calls the configured remote layout endpoint for one page, returning
/// the elements it reports (bboxes clamped to the uploaded raster's
/// dimensions, `source` forced to `remote`) or a `PageError` on any
/// transport/parse/validation failure. Never blocks past
/// `config.timeout_ms` (spec §5 "Timeouts").
/// Returns the detected elements together with the pixel dimensions of
/// the raster that was actually uploaded, so the caller can rescale the
/// (already-clamped) bboxes into whatever coordinate space it needs.
pub async fn infer_layout(
    page_id: &str,
    image: &DynamicImage,
    config: &RemoteLayoutConfig,
) -> Result<(Vec<LayoutElement>, u32, u32), PageError> {
    config
        .validate_endpoint()
        .map_err(|msg| PageError::for_page(Phase::Remote, page_id, msg))?;

    let (png_bytes, upload_w, upload_h) = prepare_upload(image, config.max_dimension_px, config.max_payload_mb);
    let body = RemoteLayoutRequest {
        page_id: page_id.to_string(),
        width: upload_w,
        height: upload_h,
        image_base64: STANDARD.encode(&png_bytes),
        image_mime: "image/png",
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()
        .map_err(|e| PageError::for_page(Phase::Remote, page_id, format!("failed to build http client: {e}")))?;

    let mut request = client.post(&config.endpoint).json(&body);
    if let Some(token) = &config.token {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| PageError::for_page(Phase::Remote, page_id, format!("remote layout request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(PageError::for_page(
            Phase::Remote,
            page_id,
            format!("remote layout endpoint returned {}", response.status()),
        ));
    }

    let parsed: RemoteLayoutResponse = response
        .json()
        .await
        .map_err(|e| PageError::for_page(Phase::Remote, page_id, format!("failed to parse remote layout response: {e}")))?;

    let elements = parsed
        .elements
        .into_iter()
        .filter_map(|el| {
            let element_type = parse_element_type(&el.element_type)?;
            Some(LayoutElement {
                id: format!("{page_id}-remote-{}", el.element_type),
                element_type,
                bbox: clamp_bbox(el.bbox, upload_w, upload_h),
                confidence: el.confidence.clamp(0.0, 1.0),
                source: ElementSource::Remote,
                flags: Vec::new(),
                text: el.text,
                notes: el.notes,
            })
        })
        .collect();

    Ok((elements, upload_w, upload_h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn prepare_upload_respects_max_dimension() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4000, 3000, Rgb([200, 200, 200])));
        let (_, w, h) = prepare_upload(&img, 1024, 10.0);
        assert!(w <= 1024 && h <= 1024);
    }

    #[test]
    fn clamp_bbox_stays_within_raster() {
        let clamped = clamp_bbox([-5, -5, 10_000, 10_000], 800, 600);
        assert_eq!(clamped, [0, 0, 799, 599]);
    }

    #[test]
    fn parse_element_type_rejects_unknown_tags() {
        assert!(parse_element_type("bogus_tag").is_none());
        assert_eq!(parse_element_type("drop_cap"), Some(ElementType::DropCap));
    }

    #[test]
    fn endpoint_validation_rejects_bad_scheme_before_any_request() {
        let config = RemoteLayoutConfig {
            endpoint: "ftp://example.com".into(),
            ..RemoteLayoutConfig::default()
        };
        assert!(config.validate_endpoint().is_err());
    }
}
