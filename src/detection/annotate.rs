// Bounding-box overlay for archived frames. Purely cosmetic.

use image::{Rgb, RgbImage};

use super::FaceRegion;

pub const MATCHED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNMATCHED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const THICKNESS: u32 = 2;

/// Draw a hollow rectangle, clipped to the image
pub fn draw_box(image: &mut RgbImage, region: &FaceRegion, color: Rgb<u8>) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || region.x >= w || region.y >= h {
        return;
    }
    let region = region.clamped(w, h);
    let x1 = region.x + region.width.saturating_sub(1);
    let y1 = region.y + region.height.saturating_sub(1);

    for t in 0..THICKNESS {
        for x in region.x..=x1 {
            put(image, x, region.y + t, color);
            put(image, x, y1.saturating_sub(t), color);
        }
        for y in region.y..=y1 {
            put(image, region.x + t, y, color);
            put(image, x1.saturating_sub(t), y, color);
        }
    }
}

fn put(image: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    if x < image.width() && y < image.height() {
        image.put_pixel(x, y, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_outline_leaves_interior_untouched() {
        let mut image = RgbImage::new(20, 20);
        draw_box(&mut image, &FaceRegion { x: 2, y: 3, width: 10, height: 8 }, UNMATCHED_COLOR);

        assert_eq!(*image.get_pixel(2, 3), UNMATCHED_COLOR);
        assert_eq!(*image.get_pixel(11, 10), UNMATCHED_COLOR);
        assert_eq!(*image.get_pixel(6, 6), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(15, 15), Rgb([0, 0, 0]));
    }

    #[test]
    fn box_past_the_edge_is_clipped() {
        let mut image = RgbImage::new(10, 10);
        draw_box(&mut image, &FaceRegion { x: 6, y: 6, width: 30, height: 30 }, MATCHED_COLOR);
        assert_eq!(*image.get_pixel(9, 9), MATCHED_COLOR);
    }
}
