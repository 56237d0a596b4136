//! Overlay drawing: boxes, label plates and the frame tag

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::info;

use super::cache::OverlayTag;
use crate::detection::{Detection, DetectionResult};
use crate::error::PipelineError;
use crate::CompositorConfig;

pub const HIGH_CONFIDENCE: Rgb<u8> = Rgb([0, 255, 0]);
pub const MEDIUM_CONFIDENCE: Rgb<u8> = Rgb([255, 255, 0]);
pub const LOW_CONFIDENCE: Rgb<u8> = Rgb([255, 165, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Box colour by confidence tier.
pub fn tier_color(confidence: f32) -> Rgb<u8> {
    if confidence > 0.8 {
        HIGH_CONFIDENCE
    } else if confidence > 0.5 {
        MEDIUM_CONFIDENCE
    } else {
        LOW_CONFIDENCE
    }
}

/// "person 87%"
pub fn label_text(detection: &Detection) -> String {
    format!(
        "{} {:.0}%",
        detection.label,
        detection.confidence * 100.0
    )
}

pub struct Renderer {
    font: Option<FontArc>,
    scale: PxScale,
    box_thickness: u32,
    /// Share of the original pixel kept under a label plate
    label_opacity: f32,
}

impl Renderer {
    pub fn new(config: &CompositorConfig) -> Result<Self, PipelineError> {
        let font = config.font_path.as_deref().map(load_font).transpose()?;
        Ok(Self {
            font,
            scale: PxScale::from(config.label_scale),
            box_thickness: config.box_thickness.max(1),
            label_opacity: config.label_opacity.clamp(0.0, 1.0),
        })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw every valid detection of `result` onto `image`; returns the
    /// label strings in drawing order.
    pub fn draw_result(&self, image: &mut RgbImage, result: &DetectionResult) -> Vec<String> {
        result
            .detections
            .iter()
            .filter(|d| d.is_valid())
            .map(|detection| self.draw_detection(image, detection))
            .collect()
    }

    pub fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) -> String {
        let (width, height) = image.dimensions();
        let color = tier_color(detection.confidence);
        let label = label_text(detection);

        let x = detection.bbox.x.clamp(0, width as i32) as u32;
        let y = detection.bbox.y.clamp(0, height as i32) as u32;
        let right = (detection.bbox.x.saturating_add(detection.bbox.width)).clamp(0, width as i32) as u32;
        let bottom = (detection.bbox.y.saturating_add(detection.bbox.height)).clamp(0, height as i32) as u32;
        let w = right.saturating_sub(x);
        let h = bottom.saturating_sub(y);
        if w == 0 || h == 0 {
            return label;
        }

        for t in 0..self.box_thickness {
            let inner_w = w.saturating_sub(2 * t);
            let inner_h = h.saturating_sub(2 * t);
            if inner_w > 0 && inner_h > 0 {
                let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(inner_w, inner_h);
                draw_hollow_rect_mut(image, rect, color);
            }
        }

        let (plate_w, plate_h) = self.plate_size(&label);
        let plate_y = if y >= plate_h { y - plate_h } else { y };
        self.draw_plate(image, x, plate_y, plate_w, plate_h);
        self.draw_label(image, x, plate_y, &label);
        label
    }

    /// Tag in the top-left corner, e.g. "[LIVE]" or "[AGE:4]"
    pub fn draw_tag(&self, image: &mut RgbImage, tag: OverlayTag) -> String {
        let text = format!("[{}]", tag);
        let (plate_w, plate_h) = self.plate_size(&text);
        self.draw_plate(image, 0, 0, plate_w, plate_h);
        self.draw_label(image, 0, 0, &text);
        text
    }

    fn plate_size(&self, text: &str) -> (u32, u32) {
        let (text_w, text_h) = match &self.font {
            Some(font) => text_size(self.scale, font, text),
            None => (
                (text.chars().count() as f32 * self.scale.x * 0.6) as u32,
                self.scale.y as u32,
            ),
        };
        (text_w + 4, text_h + 4)
    }

    /// Darken a rectangle towards black, keeping `label_opacity` of the
    /// original colour.
    fn draw_plate(&self, image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32) {
        let (width, height) = image.dimensions();
        for py in y..(y + h).min(height) {
            for px in x..(x + w).min(width) {
                let pixel = image.get_pixel_mut(px, py);
                for channel in pixel.0.iter_mut() {
                    *channel = (*channel as f32 * self.label_opacity).round() as u8;
                }
            }
        }
    }

    fn draw_label(&self, image: &mut RgbImage, x: u32, y: u32, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(image, TEXT_COLOR, x as i32 + 2, y as i32 + 2, self.scale, font, text);
        }
    }
}

fn load_font(path: &Path) -> Result<FontArc, PipelineError> {
    let data = std::fs::read(path)
        .map_err(|e| PipelineError::Config(format!("cannot read font {}: {}", path.display(), e)))?;
    let font = FontArc::try_from_vec(data)
        .map_err(|e| PipelineError::Config(format!("invalid font {}: {}", path.display(), e)))?;
    info!("Loaded label font {}", path.display());
    Ok(font)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;
    use crate::Config;

    fn renderer() -> Renderer {
        Renderer::new(&Config::default().compositor).unwrap()
    }

    fn detection(confidence: f32, bbox: BoundingBox) -> Detection {
        Detection {
            class_id: 2,
            label: "car".into(),
            confidence,
            bbox,
        }
    }

    #[test]
    fn colour_tiers() {
        assert_eq!(tier_color(0.95), HIGH_CONFIDENCE);
        assert_eq!(tier_color(0.8), MEDIUM_CONFIDENCE);
        assert_eq!(tier_color(0.6), MEDIUM_CONFIDENCE);
        assert_eq!(tier_color(0.5), LOW_CONFIDENCE);
        assert_eq!(tier_color(0.1), LOW_CONFIDENCE);
    }

    #[test]
    fn label_shows_percentage() {
        let det = detection(0.87, BoundingBox { x: 0, y: 0, width: 4, height: 4 });
        assert_eq!(label_text(&det), "car 87%");
    }

    #[test]
    fn box_outline_uses_tier_colour() {
        let renderer = renderer();
        let mut image = RgbImage::new(200, 200);
        let det = detection(0.9, BoundingBox { x: 50, y: 80, width: 60, height: 40 });
        let label = renderer.draw_detection(&mut image, &det);

        assert_eq!(label, "car 90%");
        assert_eq!(*image.get_pixel(80, 119), HIGH_CONFIDENCE);
        assert_eq!(*image.get_pixel(109, 100), HIGH_CONFIDENCE);
        // Interior untouched
        assert_eq!(*image.get_pixel(80, 100), Rgb([0, 0, 0]));
    }

    #[test]
    fn label_plate_darkens_background() {
        let renderer = renderer();
        let mut image = RgbImage::from_pixel(200, 200, Rgb([200, 200, 200]));
        let det = detection(0.3, BoundingBox { x: 50, y: 80, width: 60, height: 40 });
        renderer.draw_detection(&mut image, &det);

        // Just above the box sits the plate: 30% of 200
        assert_eq!(*image.get_pixel(52, 78), Rgb([60, 60, 60]));
        assert_eq!(*image.get_pixel(60, 100), Rgb([200, 200, 200]));
    }

    #[test]
    fn boxes_outside_the_image_are_clipped() {
        let renderer = renderer();
        let mut image = RgbImage::new(50, 50);
        let det = detection(0.9, BoundingBox { x: 40, y: 40, width: 100, height: 100 });
        renderer.draw_detection(&mut image, &det);
        assert_eq!(*image.get_pixel(45, 40), HIGH_CONFIDENCE);

        let far = detection(0.9, BoundingBox { x: 500, y: 500, width: 10, height: 10 });
        assert_eq!(renderer.draw_detection(&mut image, &far), "car 90%");
    }

    #[test]
    fn missing_font_is_a_config_error() {
        let mut config = Config::default().compositor;
        config.font_path = Some("/nonexistent/font.ttf".into());
        assert!(matches!(Renderer::new(&config), Err(PipelineError::Config(_))));
    }

    #[test]
    fn tag_text() {
        let renderer = renderer();
        let mut image = RgbImage::new(100, 100);
        assert_eq!(renderer.draw_tag(&mut image, OverlayTag::Age(4)), "[AGE:4]");
    }
}
