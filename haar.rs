//! Haar wavelet image signatures.
//!
//! An image is scaled to 128x128, converted to YIQ and decomposed with a 2D
//! Haar transform. The signature keeps the channel averages and, per
//! channel, the indices of the 40 largest coefficients, signed with the
//! coefficient's sign.

use crate::error::{Error, Result};
use crate::models::SketchType;
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;

pub const NUM_PIXELS: usize = 128;
pub const NUM_PIXELS_SQUARED: usize = NUM_PIXELS * NUM_PIXELS;
pub const NUM_COEFS: usize = 40;

const SIGNATURE_VERSION: u32 = 1;
const SIGNATURE_BYTES: usize = 4 + 3 * 8 + 3 * NUM_COEFS * 4;

// Rows are coefficient bins (0 is the average), columns Y, I, Q.
const WEIGHTS: [[[f64; 3]; 6]; 2] = [
    [
        [5.00, 19.21, 34.37],
        [0.83, 1.26, 0.36],
        [1.01, 0.44, 0.45],
        [0.52, 0.53, 0.14],
        [0.47, 0.28, 0.18],
        [0.30, 0.14, 0.27],
    ],
    [
        [4.04, 15.14, 22.62],
        [0.78, 0.92, 0.40],
        [0.46, 0.53, 0.63],
        [0.42, 0.26, 0.25],
        [0.41, 0.14, 0.15],
        [0.32, 0.07, 0.38],
    ],
];

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub avg: [f64; 3],
    /// Sorted signed coefficient indices per channel.
    pub sig: [[i32; NUM_COEFS]; 3],
}

impl Signature {
    pub fn from_path(path: &Path) -> Result<Self> {
        let img = image::open(path)?;
        Ok(Self::from_image(&img))
    }

    pub fn from_image(img: &DynamicImage) -> Self {
        let rgb = img
            .resize_exact(NUM_PIXELS as u32, NUM_PIXELS as u32, FilterType::Triangle)
            .to_rgb8();

        let mut channels = [
            vec![0f64; NUM_PIXELS_SQUARED],
            vec![0f64; NUM_PIXELS_SQUARED],
            vec![0f64; NUM_PIXELS_SQUARED],
        ];
        for (i, pixel) in rgb.pixels().enumerate() {
            let r = f64::from(pixel[0]) / 255.0;
            let g = f64::from(pixel[1]) / 255.0;
            let b = f64::from(pixel[2]) / 255.0;
            channels[0][i] = 0.299 * r + 0.587 * g + 0.114 * b;
            channels[1][i] = 0.596 * r - 0.275 * g - 0.321 * b;
            channels[2][i] = 0.212 * r - 0.523 * g + 0.311 * b;
        }

        let mut avg = [0f64; 3];
        let mut sig = [[0i32; NUM_COEFS]; 3];
        for (c, data) in channels.iter_mut().enumerate() {
            haar_2d(data);
            // Orthonormal transform: the DC term is the mean scaled by N.
            avg[c] = data[0] / NUM_PIXELS as f64;
            sig[c] = largest_coefficients(data);
        }
        Signature { avg, sig }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNATURE_BYTES);
        out.extend_from_slice(&SIGNATURE_VERSION.to_le_bytes());
        for avg in self.avg {
            out.extend_from_slice(&avg.to_le_bytes());
        }
        for channel in &self.sig {
            for coef in channel {
                out.extend_from_slice(&coef.to_le_bytes());
            }
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != SIGNATURE_BYTES {
            return Err(Error::Signature(format!(
                "expected {SIGNATURE_BYTES} bytes, got {}",
                data.len()
            )));
        }
        let version = u32::from_le_bytes(take::<4>(data, 0));
        if version != SIGNATURE_VERSION {
            return Err(Error::Signature(format!("unsupported version {version}")));
        }
        let mut avg = [0f64; 3];
        for (c, value) in avg.iter_mut().enumerate() {
            *value = f64::from_le_bytes(take::<8>(data, 4 + c * 8));
        }
        let mut sig = [[0i32; NUM_COEFS]; 3];
        let mut offset = 4 + 3 * 8;
        for channel in sig.iter_mut() {
            for coef in channel.iter_mut() {
                *coef = i32::from_le_bytes(take::<4>(data, offset));
                offset += 4;
            }
        }
        Ok(Signature { avg, sig })
    }

    /// Weighted distance, lower is closer. Comparing a signature with itself
    /// gives the lowest possible score.
    pub fn score(&self, target: &Signature, sketch: SketchType) -> f64 {
        let weights = &WEIGHTS[sketch_index(sketch)];
        let mut score = 0.0;
        for c in 0..3 {
            score += weights[0][c] * (self.avg[c] - target.avg[c]).abs();
        }
        for c in 0..3 {
            for coef in &self.sig[c] {
                if target.sig[c].binary_search(coef).is_ok() {
                    score -= weights[bin(coef.unsigned_abs() as usize)][c];
                }
            }
        }
        score
    }

    /// Similarity in `[0, 1]`, 1 meaning identical signatures. This is the
    /// inverse of `score`, where lower is closer; duplicate thresholds such
    /// as the default 0.4..=1.0 band are compared against this value.
    pub fn similarity(&self, target: &Signature, sketch: SketchType) -> f64 {
        let best = self.score(self, sketch);
        if best >= 0.0 {
            return 0.0;
        }
        (self.score(target, sketch) / best).clamp(0.0, 1.0)
    }
}

fn take<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn sketch_index(sketch: SketchType) -> usize {
    match sketch {
        SketchType::Scanned => 0,
        SketchType::Handdrawn => 1,
    }
}

fn bin(index: usize) -> usize {
    let row = index / NUM_PIXELS;
    let col = index % NUM_PIXELS;
    row.max(col).min(5)
}

/// In-place standard 2D decomposition: every row fully, then every column.
fn haar_2d(data: &mut [f64]) {
    let mut scratch = vec![0f64; NUM_PIXELS];
    let mut line = vec![0f64; NUM_PIXELS];
    for row in 0..NUM_PIXELS {
        let start = row * NUM_PIXELS;
        line.copy_from_slice(&data[start..start + NUM_PIXELS]);
        haar_1d(&mut line, &mut scratch);
        data[start..start + NUM_PIXELS].copy_from_slice(&line);
    }
    for col in 0..NUM_PIXELS {
        for row in 0..NUM_PIXELS {
            line[row] = data[row * NUM_PIXELS + col];
        }
        haar_1d(&mut line, &mut scratch);
        for row in 0..NUM_PIXELS {
            data[row * NUM_PIXELS + col] = line[row];
        }
    }
}

fn haar_1d(line: &mut [f64], scratch: &mut [f64]) {
    let norm = std::f64::consts::FRAC_1_SQRT_2;
    let mut len = line.len();
    while len > 1 {
        let half = len / 2;
        for k in 0..half {
            let a = line[2 * k];
            let b = line[2 * k + 1];
            scratch[k] = (a + b) * norm;
            scratch[half + k] = (a - b) * norm;
        }
        line[..len].copy_from_slice(&scratch[..len]);
        len = half;
    }
}

fn largest_coefficients(data: &[f64]) -> [i32; NUM_COEFS] {
    let mut indices: Vec<usize> = (1..NUM_PIXELS_SQUARED).collect();
    indices.select_nth_unstable_by(NUM_COEFS - 1, |a, b| data[*b].abs().total_cmp(&data[*a].abs()));
    let mut out = [0i32; NUM_COEFS];
    for (slot, index) in out.iter_mut().zip(indices.iter().take(NUM_COEFS)) {
        let signed = *index as i32;
        *slot = if data[*index] > 0.0 { signed } else { -signed };
    }
    out.sort_unstable();
    out
}
