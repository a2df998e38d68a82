//! Draws detections and the counted total onto a copy of the frame.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TICK_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const TICK_WIDTH: u32 = 4;
const TICK_HEIGHT: u32 = 12;
const TICK_GAP: u32 = 2;
const MARGIN: u32 = 4;

/// Returns an annotated copy of `image` with one box per detection and one tick per counted person.
pub fn annotate(image: &RgbImage, detections: &[Detection], count: usize) -> RgbImage {
    let mut out = image.clone();
    for detection in detections {
        draw_box(&mut out, detection);
    }
    draw_count_bar(&mut out, count);
    out
}

fn draw_box(image: &mut RgbImage, detection: &Detection) {
    let bbox = detection.bbox.clamp_to(image.width(), image.height());
    let x = bbox.x0.round() as i32;
    let y = bbox.y0.round() as i32;
    let w = bbox.width().round() as i32;
    let h = bbox.height().round() as i32;
    for inset in 0..BOX_THICKNESS {
        let (rw, rh) = (w - 2 * inset, h - 2 * inset);
        if rw <= 0 || rh <= 0 {
            break;
        }
        let rect = Rect::at(x + inset, y + inset).of_size(rw as u32, rh as u32);
        draw_hollow_rect_mut(image, rect, BOX_COLOR);
    }
}

fn draw_count_bar(image: &mut RgbImage, count: usize) {
    let step = TICK_WIDTH + TICK_GAP;
    let max_ticks = (image.width().saturating_sub(2 * MARGIN) / step) as usize;
    if image.height() < MARGIN + TICK_HEIGHT {
        return;
    }
    for tick in 0..count.min(max_ticks) {
        let x = MARGIN + tick as u32 * step;
        let rect = Rect::at(x as i32, MARGIN as i32).of_size(TICK_WIDTH, TICK_HEIGHT);
        draw_filled_rect_mut(image, rect, TICK_COLOR);
    }
}
