//! Frame annotation: track boxes, labels and the running object count
//!
//! Labels and the count overlay use the bundled DejaVu Sans Mono unless a
//! TrueType font file is configured.

use crate::{VideoError, VideoResult};
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::info;
use video_track_common::Detection;

const PALETTE: [[u8; 3]; 10] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [250, 190, 212],
];

const DEFAULT_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const OVERLAY_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

/// Draws detections onto frames
pub struct Annotator {
    font: FontArc,
    scale: PxScale,
    line_thickness: u32,
}

impl Annotator {
    /// Use the font at `font_path`, or the bundled font when unset
    pub fn new(font_path: Option<&Path>) -> VideoResult<Self> {
        let font = match font_path {
            Some(path) => {
                let data = std::fs::read(path)
                    .map_err(|e| VideoError::Font(format!("{}: {e}", path.display())))?;
                let font = FontArc::try_from_vec(data)
                    .map_err(|e| VideoError::Font(format!("{}: {e}", path.display())))?;
                info!("Loaded label font {}", path.display());
                font
            }
            None => FontArc::try_from_slice(DEFAULT_FONT)
                .map_err(|e| VideoError::Font(format!("bundled font: {e}")))?,
        };

        Ok(Self {
            font,
            scale: PxScale::from(18.0),
            line_thickness: 2,
        })
    }

    /// `#7 logo 0.91`
    #[must_use]
    pub fn label(detection: &Detection) -> String {
        format!(
            "#{} {} {:.2}",
            detection.track_id, detection.class_label, detection.confidence
        )
    }

    /// Stable colour for a track id
    #[must_use]
    pub fn track_color(track_id: u32) -> Rgb<u8> {
        Rgb(PALETTE[track_id as usize % PALETTE.len()])
    }

    /// Box plus label for one detection
    pub fn draw_detection(&self, frame: &mut RgbImage, detection: &Detection) {
        let (x, y, w, h) = detection.bbox.to_pixels(frame.width(), frame.height());
        if w == 0 || h == 0 {
            return;
        }

        let color = Self::track_color(detection.track_id);
        for t in 0..self.line_thickness {
            let inner_w = w.saturating_sub(2 * t);
            let inner_h = h.saturating_sub(2 * t);
            if inner_w > 0 && inner_h > 0 {
                let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(inner_w, inner_h);
                draw_hollow_rect_mut(frame, rect, color);
            }
        }

        let text = Self::label(detection);
        let (text_w, text_h) = text_size(self.scale, &self.font, &text);
        let text_y = if y >= text_h + 4 { y - text_h - 4 } else { y + h };
        draw_filled_rect_mut(
            frame,
            Rect::at(x as i32, text_y as i32).of_size(text_w + 4, text_h + 4),
            color,
        );
        draw_text_mut(
            frame,
            TEXT_COLOR,
            x as i32 + 2,
            text_y as i32 + 2,
            self.scale,
            &self.font,
            &text,
        );
    }

    /// `Total objects: N` in the top-left corner
    pub fn draw_total(&self, frame: &mut RgbImage, total: usize) {
        let text = format!("Total objects: {total}");
        let (text_w, text_h) = text_size(self.scale, &self.font, &text);
        draw_filled_rect_mut(
            frame,
            Rect::at(4, 4).of_size(text_w + 8, text_h + 8),
            OVERLAY_BACKGROUND,
        );
        draw_text_mut(frame, TEXT_COLOR, 8, 8, self.scale, &self.font, &text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_track_common::BoundingBox;

    fn detection(track_id: u32) -> Detection {
        Detection {
            track_id,
            class_label: "logo".to_string(),
            confidence: 0.914,
            bbox: BoundingBox::new(0.25, 0.25, 0.5, 0.5),
        }
    }

    #[test]
    fn test_label_format() {
        assert_eq!(Annotator::label(&detection(7)), "#7 logo 0.91");
    }

    #[test]
    fn test_track_colors() {
        assert_eq!(Annotator::track_color(3), Annotator::track_color(3));
        assert_ne!(Annotator::track_color(1), Annotator::track_color(2));
    }

    fn annotator() -> Annotator {
        Annotator::new(None).unwrap()
    }

    #[test]
    fn test_draw_box_outline() {
        let mut frame = RgbImage::new(100, 100);
        annotator().draw_detection(&mut frame, &detection(1));

        let color = Annotator::track_color(1);
        assert_eq!(*frame.get_pixel(25, 50), color);
        assert_eq!(*frame.get_pixel(26, 50), color);
        // Interior untouched
        assert_eq!(*frame.get_pixel(50, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_default_font_draws_label() {
        let mut frame = RgbImage::new(200, 200);
        annotator().draw_detection(&mut frame, &detection(1));

        // Box starts at y=50; the label sits above it on a track-coloured tag
        let color = Annotator::track_color(1);
        let glyph_pixels = (0..50)
            .flat_map(|y| (50..150).map(move |x| (x, y)))
            .map(|(x, y)| *frame.get_pixel(x, y))
            .filter(|p| *p != color && *p != Rgb([0, 0, 0]))
            .count();
        assert!(glyph_pixels > 0);
    }

    #[test]
    fn test_default_font_draws_total() {
        let background = Rgb([9, 9, 9]);
        let mut frame = RgbImage::from_pixel(200, 200, background);
        annotator().draw_total(&mut frame, 3);

        assert_eq!(*frame.get_pixel(4, 4), OVERLAY_BACKGROUND);
        let glyph_pixels = frame
            .pixels()
            .filter(|p| **p != background && **p != OVERLAY_BACKGROUND)
            .count();
        assert!(glyph_pixels > 0);
    }

    #[test]
    fn test_missing_font_file() {
        let result = Annotator::new(Some(Path::new("/nonexistent/font.ttf")));
        assert!(matches!(result, Err(VideoError::Font(_))));
    }
}
