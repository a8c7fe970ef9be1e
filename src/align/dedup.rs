//! Motion-based frame deduplication.

/// Indices of frames to keep: frame 0 always, then every frame whose largest per-dimension
/// difference from the last kept pose exceeds `tolerance`. A pose of different
/// dimension counts as motion.
pub fn motion_keep_indices(poses: &[Vec<f64>], tolerance: f64) -> Vec<usize> {
    let mut keep = Vec::new();
    let mut reference: Option<&[f64]> = None;
    for (i, pose) in poses.iter().enumerate() {
        let moved = match reference {
            None => true,
            Some(prev) => {
                prev.len() != pose.len()
                    || prev
                        .iter()
                        .zip(pose)
                        .map(|(a, b)| (a - b).abs())
                        .fold(0.0f64, f64::max)
                        > tolerance
            }
        };
        if moved {
            keep.push(i);
            reference = Some(pose.as_slice());
        }
    }
    keep
}

/// Picks `values[i]` for every `i` in `indices`.
pub fn gather<T: Clone>(values: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().filter_map(|&i| values.get(i).cloned()).collect()
}
