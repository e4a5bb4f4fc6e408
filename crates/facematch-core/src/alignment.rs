//! Face alignment via 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the InsightFace reference positions
//! and warps the face into a canonical 112x112 crop.

use crate::pixels::{PixelArray, CHANNELS};

/// ArcFace reference landmarks for a 112x112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit from `src` to `dst` on centered points.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut var = 0.0f32;
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - msx, s.1 - msy);
            let (dx, dy) = (d.0 - mdx, d.1 - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            var += sx * sx + sy * sy;
        }

        if var < 1e-12 {
            return None;
        }

        let a = dot / var;
        let b = cross / var;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    /// Map a destination point back into source coordinates.
    fn inverse_apply(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        (
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        )
    }
}

/// Bilinear sample of every channel; out-of-bounds reads as black.
fn sample(pixels: &PixelArray, x: f32, y: f32) -> [f32; CHANNELS] {
    let at = |px: i64, py: i64, c: usize| -> f32 {
        if px < 0 || py < 0 || px >= pixels.width as i64 || py >= pixels.height as i64 {
            return 0.0;
        }
        let offset = (py as usize * pixels.width as usize + px as usize) * CHANNELS + c;
        pixels.data.get(offset).copied().unwrap_or(0) as f32
    };

    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    std::array::from_fn(|c| {
        at(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
            + at(x0 + 1, y0, c) * fx * (1.0 - fy)
            + at(x0, y0 + 1, c) * (1.0 - fx) * fy
            + at(x0 + 1, y0 + 1, c) * fx * fy
    })
}

/// Align a detected face to a canonical 112x112 interleaved RGB crop.
///
/// Degenerate landmarks (all at one point) produce an all-black crop.
pub fn align_face(pixels: &PixelArray, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let mut output = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE * CHANNELS];
    let Some(transform) = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112) else {
        tracing::warn!("degenerate landmarks, skipping alignment");
        return output;
    };

    for (i, out) in output.chunks_exact_mut(CHANNELS).enumerate() {
        let (ox, oy) = ((i % ALIGNED_SIZE) as f32, (i / ALIGNED_SIZE) as f32);
        let (sx, sy) = transform.inverse_apply(ox, oy);
        for (dst, value) in out.iter_mut().zip(sample(pixels, sx, sy)) {
            *dst = value.round().clamp(0.0, 255.0) as u8;
        }
    }

    output
}
