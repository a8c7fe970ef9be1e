//! Nearest-neighbour resampling of one sorted timestamp sequence onto another.

use crate::error::AlignError;

/// Canonical timeline: per-frame mean of the camera timestamps, truncated toward zero.
pub fn reference_timeline(cameras: &[(&str, &[i64])]) -> Result<Vec<i64>, AlignError> {
    let Some((_, first)) = cameras.first() else {
        return Err(AlignError::NoCameras);
    };
    let frames = first.len();
    for (camera, stamps) in cameras {
        if stamps.len() != frames {
            return Err(AlignError::CameraLengthMismatch {
                camera: camera.to_string(),
                expected: frames,
                found: stamps.len(),
            });
        }
    }

    let n = cameras.len() as i128;
    Ok((0..frames)
        .map(|i| {
            let sum: i128 = cameras.iter().map(|(_, s)| s[i] as i128).sum();
            (sum / n) as i64
        })
        .collect())
}

#[inline]
fn distance(a: i64, b: i64) -> u128 {
    (a as i128 - b as i128).unsigned_abs()
}

/// For each `reference` time, the index of the closest `samples` time.
///
/// Both inputs must be sorted ascending. A monotone pointer advances while the next
/// sample is still before the reference time; the choice then moves forward over
/// candidates at equal or smaller distance, so ties go to the later index. The chosen
/// index never decreases, so the pointer restarts from it and runs of repeated sample
/// times are scanned once overall. Returns
/// `None` when `samples` is empty and there is something to align.
pub fn nearest_indices(reference: &[i64], samples: &[i64]) -> Option<Vec<usize>> {
    if reference.is_empty() {
        return Some(Vec::new());
    }
    let last = samples.len().checked_sub(1)?;

    let mut out = Vec::with_capacity(reference.len());
    let mut ptr = 0usize;
    for &t in reference {
        while ptr < last && samples[ptr + 1] < t {
            ptr += 1;
        }
        let mut idx = ptr;
        while idx < last && distance(samples[idx + 1], t) <= distance(samples[idx], t) {
            idx += 1;
        }
        out.push(idx);
        ptr = idx;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_pick_the_later_sample() {
        let idx = nearest_indices(&[1000, 2000], &[900, 1100, 1950, 2050]).unwrap();
        assert_eq!(idx, vec![1, 3]);
    }

    #[test]
    fn reference_before_and_after_all_samples() {
        let idx = nearest_indices(&[0, 5, 100], &[10, 20, 30]).unwrap();
        assert_eq!(idx, vec![0, 0, 2]);
    }

    #[test]
    fn repeated_sample_times_resolve_to_the_last_copy() {
        let idx = nearest_indices(&[20], &[10, 20, 20, 20, 30]).unwrap();
        assert_eq!(idx, vec![3]);
    }

    #[test]
    fn long_run_of_equal_times_keeps_resolving_to_its_end() {
        let mut samples = vec![0i64];
        samples.extend(std::iter::repeat_n(50, 5_000));
        samples.push(100);
        let reference = vec![40i64; 1_000];
        let idx = nearest_indices(&reference, &samples).unwrap();
        assert!(idx.iter().all(|&i| i == 5_000));
        assert_eq!(nearest_indices(&[40, 90, 100], &samples).unwrap(), vec![5_000, 5_001, 5_001]);
    }

    #[test]
    fn empty_samples_cannot_be_aligned() {
        assert!(nearest_indices(&[1], &[]).is_none());
        assert_eq!(nearest_indices(&[], &[]), Some(vec![]));
    }

    #[test]
    fn timeline_is_the_truncated_camera_mean() {
        let a = [10i64, 20];
        let b = [11i64, 21];
        let c = [13i64, 23];
        let t = reference_timeline(&[("a", &a), ("b", &b), ("c", &c)]).unwrap();
        assert_eq!(t, vec![11, 21]);
    }

    #[test]
    fn cameras_of_different_length_are_rejected() {
        let a = [1i64, 2];
        let b = [1i64];
        assert!(matches!(
            reference_timeline(&[("a", &a), ("b", &b)]),
            Err(AlignError::CameraLengthMismatch { found: 1, .. })
        ));
    }
}
