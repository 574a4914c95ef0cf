// Local binary pattern face embedding
//
// The face crop is normalised to a fixed size, every interior pixel is coded
// by comparing it with its eight neighbours, and the codes are histogrammed
// over a 4x4 grid. The concatenated histograms are L2-normalised, so the
// Euclidean distance between two embeddings lies in [0, 2].

use image::imageops::{self, FilterType};
use image::GrayImage;

use super::{FaceEmbedder, FaceRegion};

const CROP_SIZE: u32 = 64;
const GRID: u32 = 4;
const BINS: usize = 256;

/// Length of every embedding produced by [`LbphEmbedder`]
pub const LBPH_DIMENSION: usize = (GRID * GRID) as usize * BINS;

#[derive(Debug, Default, Clone, Copy)]
pub struct LbphEmbedder;

impl LbphEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn histogram(crop: &GrayImage) -> Vec<f32> {
        let mut hist = vec![0f32; LBPH_DIMENSION];
        let cell = CROP_SIZE / GRID;

        for y in 1..CROP_SIZE - 1 {
            for x in 1..CROP_SIZE - 1 {
                let center = crop.get_pixel(x, y).0[0];
                let mut code = 0u8;
                let neighbours = [
                    (x - 1, y - 1),
                    (x, y - 1),
                    (x + 1, y - 1),
                    (x + 1, y),
                    (x + 1, y + 1),
                    (x, y + 1),
                    (x - 1, y + 1),
                    (x - 1, y),
                ];
                for (bit, (nx, ny)) in neighbours.into_iter().enumerate() {
                    if crop.get_pixel(nx, ny).0[0] >= center {
                        code |= 1 << bit;
                    }
                }
                let cell_index = ((y / cell).min(GRID - 1) * GRID + (x / cell).min(GRID - 1)) as usize;
                hist[cell_index * BINS + code as usize] += 1.0;
            }
        }

        let norm = hist.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut hist {
                *v /= norm;
            }
        }
        hist
    }
}

impl FaceEmbedder for LbphEmbedder {
    fn embed(&self, gray: &GrayImage, region: &FaceRegion) -> Vec<f32> {
        let region = region.clamped(gray.width(), gray.height());
        let crop = imageops::crop_imm(gray, region.x, region.y, region.width.max(1), region.height.max(1))
            .to_image();
        let crop = imageops::resize(&crop, CROP_SIZE, CROP_SIZE, FilterType::Triangle);
        Self::histogram(&crop)
    }

    fn dimension(&self) -> usize {
        LBPH_DIMENSION
    }
}

/// Euclidean distance; mismatched lengths are infinitely far apart
pub fn embedding_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
