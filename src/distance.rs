// Copyright (c) 2025 SynaDB Contributors
// Licensed under the SynaDB License. See LICENSE file for details.

//! Distance metrics for vector similarity search.
//!
//! All metrics are designed so that lower values indicate more similar vectors.
//! The metric is fixed when an index is created and recorded in its manifest;
//! the local graphs, the centroid graph and the partitioner all use it.
//!
//! | Metric | Range | Best For |
//! |--------|-------|----------|
//! | Cosine | [0, 2] | Text embeddings, normalized vectors |
//! | Euclidean | [0, ∞) | Image features, spatial data |
//! | DotProduct | (-∞, ∞) | Pre-normalized vectors, recommendation |
//!
//! ```rust
//! use syna_ivf::distance::DistanceMetric;
//!
//! let a = vec![1.0f32, 0.0, 0.0];
//! let b = vec![0.0f32, 1.0, 0.0];
//!
//! let cosine_dist = DistanceMetric::Cosine.distance(&a, &b);
//! assert!((cosine_dist - 1.0).abs() < 1e-6);
//!
//! let euclidean_dist = DistanceMetric::Euclidean.distance(&a, &b);
//! assert!((euclidean_dist - std::f32::consts::SQRT_2).abs() < 1e-6);
//! ```

use serde::{Deserialize, Serialize};

/// Distance metric for similarity search.
///
/// Determines how vector similarity is computed. All metrics return
/// lower values for more similar vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Cosine distance: `1 - cos(θ)` where θ is the angle between vectors.
    ///
    /// Range: [0, 2]. Invariant to vector magnitude.
    Cosine,

    /// Euclidean (L2) distance: `sqrt(Σ(a_i - b_i)²)`.
    Euclidean,

    /// Negative dot product: `-Σ(a_i * b_i)`.
    DotProduct,
}

impl DistanceMetric {
    /// Compute distance between two vectors.
    ///
    /// # Panics
    ///
    /// Debug builds will panic if vectors have different lengths.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");
        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::Euclidean => euclidean_distance(a, b),
            DistanceMetric::DotProduct => dot_product_distance(a, b),
        }
    }
}

/// Mean of a set of vectors. Returns a zero vector for an empty set.
pub fn centroid<'a, I>(vectors: I, dims: usize) -> Vec<f32>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum = vec![0.0f32; dims];
    let mut count = 0usize;
    for v in vectors {
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += x;
        }
        count += 1;
    }
    if count > 0 {
        let n = count as f32;
        for s in sum.iter_mut() {
            *s /= n;
        }
    }
    sum
}

/// Cosine distance: `1 - (a·b)/(|a||b|)`.
///
/// Zero vectors return distance 1.0 (treated as orthogonal).
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom < 1e-10 {
        return 1.0;
    }
    1.0 - (dot / denom)
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum.sqrt()
}

fn dot_product_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
    }
    -dot
}
