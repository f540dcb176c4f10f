//! Fade-in / fade-out envelope used to blend overlapping chunk outputs.

use ndarray::Array1;

/// All ones except a linear 0→1 ramp over the first `fade_size` samples and
/// a linear 1→0 ramp over the last `fade_size` samples.
///
/// Ramps are inclusive at both ends (`linspace` semantics): a ramp of
/// length `n > 1` hits exactly 0.0 and 1.0 at its extremes, a ramp of
/// length 1 is the single value at its start. Ramps are applied
/// multiplicatively, so overlapping fades (`fade_size > size / 2`) still
/// yield a well-defined envelope, though plans never request that.
pub fn window(size: usize, fade_size: usize) -> Array1<f32> {
    let mut w = Array1::<f32>::ones(size);
    let fade = fade_size.min(size);
    if fade == 0 {
        return w;
    }

    let ramp = |k: usize| -> f32 {
        if fade == 1 {
            0.0
        } else {
            k as f32 / (fade - 1) as f32
        }
    };

    for k in 0..fade {
        w[size - fade + k] *= 1.0 - ramp(k);
    }
    for k in 0..fade {
        w[k] *= ramp(k);
    }
    w
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramps_hit_endpoints() {
        let w = window(100, 10);
        assert_eq!(w.len(), 100);
        assert_eq!(w[0], 0.0);
        assert_eq!(w[9], 1.0);
        assert_eq!(w[90], 1.0);
        assert_eq!(w[99], 0.0);
        assert!(w.slice(ndarray::s![10..90]).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn ramp_is_linear_and_symmetric() {
        let w = window(40, 5);
        for k in 0..5 {
            approx::assert_abs_diff_eq!(w[k], k as f32 / 4.0, epsilon = 1e-6);
            approx::assert_abs_diff_eq!(w[k], w[39 - k], epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_fade_is_flat() {
        let w = window(8, 0);
        assert!(w.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn deterministic_across_calls() {
        assert_eq!(window(352_800, 35_280), window(352_800, 35_280));
    }
}
