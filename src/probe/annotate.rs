use std::path::Path;

use ab_glyph::{FontVec, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use indexmap::IndexMap;
use thiserror::Error;

use super::cost::CostedDetection;
use crate::config::ClassConfig;

const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 16.0;
const LABEL_OFFSET: i32 = 10;
const UNKNOWN_COLOR: [u8; 3] = [255, 0, 0];

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("invalid font: {0}")]
    Font(#[from] InvalidFont),
}

pub fn load_font(path: &Path) -> Result<FontVec, AnnotateError> {
    Ok(FontVec::try_from_vec(std::fs::read(path)?)?)
}

pub fn class_label(class_id: i64, classes: &IndexMap<i64, ClassConfig>) -> String {
    classes
        .get(&class_id)
        .map(|x| x.name.clone())
        .unwrap_or_else(|| format!("Unknown ({class_id})"))
}

pub fn box_label(costed: &CostedDetection, classes: &IndexMap<i64, ClassConfig>) -> String {
    let cost = costed
        .estimated_cost
        .map(|x| format!("{x:.2}"))
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "{} ({:.1}%) | Est. {cost}€",
        class_label(costed.detection.class_id, classes),
        costed.detection.confidence * 100.0
    )
}

/// Draws every detection onto `canvas`. Labels are only rendered when a font is available.
pub fn draw_detections(
    canvas: &mut RgbImage,
    detections: &[CostedDetection],
    classes: &IndexMap<i64, ClassConfig>,
    font: Option<&FontVec>,
) {
    for costed in detections {
        let [x_min, y_min, x_max, y_max] = costed.detection.bbox.map(|c| c as i32);
        let color = Rgb(classes
            .get(&costed.detection.class_id)
            .map(|x| x.color)
            .unwrap_or(UNKNOWN_COLOR));

        for inset in 0..BOX_THICKNESS {
            let width = x_max - x_min - 2 * inset;
            let height = y_max - y_min - 2 * inset;
            if width <= 0 || height <= 0 {
                break;
            }
            draw_hollow_rect_mut(
                canvas,
                Rect::at(x_min + inset, y_min + inset).of_size(width as u32, height as u32),
                color,
            );
        }

        if let Some(font) = font {
            let y = (y_min - LABEL_OFFSET - LABEL_SCALE as i32).max(0);
            draw_text_mut(
                canvas,
                color,
                x_min.max(0),
                y,
                PxScale::from(LABEL_SCALE),
                font,
                &box_label(costed, classes),
            );
        }
    }
}

/// Writes an annotated copy of `source` to `output`; the format follows the output extension.
pub fn draw_boxes(
    source: &Path,
    detections: &[CostedDetection],
    output: &Path,
    classes: &IndexMap<i64, ClassConfig>,
    font: Option<&FontVec>,
) -> Result<(), AnnotateError> {
    let mut canvas = image::open(source)?.to_rgb8();
    draw_detections(&mut canvas, detections, classes, font);
    canvas.save(output)?;
    Ok(())
}
