use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::model::{BBox, Detection};

const PALETTE_SIZE: usize = 20;
const LINE_WIDTH: u32 = 2;

/// Colour of a class, evenly spaced hues over a palette of 20 (the VOC classes).
pub fn class_color(class_id: usize) -> Rgb<u8> {
    let hue = (class_id % PALETTE_SIZE) as f32 / PALETTE_SIZE as f32 * 360.0;
    hsv_to_rgb(hue, 0.8, 0.9)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    Rgb([
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    ])
}

/// Pixel rectangle of `bbox` clipped to the image, `None` when nothing is left.
fn clip_to_image(bbox: &BBox, width: u32, height: u32) -> Option<Rect> {
    let x1 = bbox.x1.max(0.0).round();
    let y1 = bbox.y1.max(0.0).round();
    let x2 = bbox.x2.min(width as f32).round();
    let y2 = bbox.y2.min(height as f32).round();
    if !(x2 > x1 && y2 > y1) {
        return None;
    }
    Some(Rect::at(x1 as i32, y1 as i32).of_size((x2 - x1) as u32, (y2 - y1) as u32))
}

/// Draws every detection as a class-coloured rectangle. Boxes are in pixels of `image`.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = image.dimensions();
    for det in detections {
        let Some(rect) = clip_to_image(&det.bbox, width, height) else {
            log::debug!("Skipping box outside the image: {:?}", det.bbox);
            continue;
        };
        let color = class_color(det.class_id);

        for t in 0..LINE_WIDTH {
            let w = rect.width().saturating_sub(2 * t);
            let h = rect.height().saturating_sub(2 * t);
            if w == 0 || h == 0 {
                break;
            }
            let inner = Rect::at(rect.left() + t as i32, rect.top() + t as i32).of_size(w, h);
            draw_hollow_rect_mut(image, inner, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: BBox, class_id: usize) -> Detection {
        Detection {
            bbox,
            class_id,
            confidence: 0.9,
            class_score: 0.8,
        }
    }

    #[test]
    fn test_class_colors() {
        assert_ne!(class_color(0), class_color(1));
        assert_eq!(class_color(3), class_color(3 + PALETTE_SIZE));
        assert_ne!(class_color(7), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_box_outline() {
        let mut image = RgbImage::new(40, 40);
        draw_detections(&mut image, &[detection(BBox::new(10.0, 10.0, 30.0, 20.0), 3)]);

        let color = class_color(3);
        assert_eq!(*image.get_pixel(10, 15), color);
        assert_eq!(*image.get_pixel(11, 15), color);
        assert_eq!(*image.get_pixel(29, 15), color);
        assert_eq!(*image.get_pixel(20, 10), color);
        assert_eq!(*image.get_pixel(20, 19), color);
        // inside and outside stay untouched
        assert_eq!(*image.get_pixel(20, 15), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_boxes_clipped_to_image() {
        let mut image = RgbImage::new(40, 40);
        let detections = [
            detection(BBox::new(-50.0, -50.0, -10.0, -10.0), 0),
            detection(BBox::new(60.0, 5.0, 90.0, 30.0), 0),
            detection(BBox::new(f32::NAN, 0.0, 10.0, 10.0), 0),
            detection(BBox::new(-5.0, -5.0, 1000.0, 1000.0), 1),
        ];
        draw_detections(&mut image, &detections);

        let color = class_color(1);
        assert_eq!(*image.get_pixel(0, 20), color);
        assert_eq!(*image.get_pixel(39, 20), color);
        assert_eq!(*image.get_pixel(20, 39), color);
        assert_eq!(*image.get_pixel(20, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_thin_box_does_not_panic() {
        let mut image = RgbImage::new(10, 10);
        draw_detections(&mut image, &[detection(BBox::new(2.0, 2.0, 3.0, 8.0), 2)]);
        assert_eq!(*image.get_pixel(2, 5), class_color(2));
    }
}
