
/// Map a provider-native vector into the shared storage width.
///
/// Shorter vectors are copied into a zero-filled vector of `target_dim` starting at index
/// 0; wider ones keep their first `target_dim` entries. Values are never rescaled.
/// `native_dim` is the width the provider declared; only the first
/// `min(native_dim, vector.len())` entries of `vector` are read.
#[inline]
pub fn normalize(vector: &[f32], native_dim: usize, target_dim: usize) -> Vec<f32> {
    let mut normalized = vec![0.0_f32; target_dim];
    let copied = native_dim.min(target_dim).min(vector.len());
    normalized[..copied].copy_from_slice(&vector[..copied]);
    normalized
}

/// Cosine similarity over the full width of two equally sized vectors. Zero vectors score 0.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0_f32, 0.0_f32, 0.0_f32);
    for (x, y) in a.iter().zip(b) {
        dot = x.mul_add(*y, dot);
        norm_a = x.mul_add(*x, norm_a);
        norm_b = y.mul_add(*y, norm_b);
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 {
        0.0
    } else {
        dot / denominator
    }
}
