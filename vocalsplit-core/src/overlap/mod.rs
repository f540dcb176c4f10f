//! Chunked overlap-add processing.
//!
//! Lets a fixed-window estimator process arbitrarily long audio:
//!
//! ```text
//! waveform ──reflect-pad(border)──► [ chunk 0 ][ chunk 1 ] ...   (stride = step)
//!                                        │          │
//!                                    infer_fn   infer_fn
//!                                        │          │
//!                        result  += estimate × window
//!                        counter += window
//! output = result / counter ──strip(border)──► same length as input
//! ```
//!
//! The window tapers each chunk's edges so overlapping contributions blend
//! instead of hard-cutting. The first chunk uses the window with its fade-in
//! flattened: nothing precedes it, and a zero weight at sample 0 would leave
//! `counter` empty there.

pub mod window;

use ndarray::{s, Array2, ArrayView2};
use tracing::debug;

use crate::audio::Waveform;
use crate::error::{Result, SeparationError};

pub use window::window;

/// Chunking geometry derived from the model window size and overlap factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapPlan {
    chunk_size: usize,
    step: usize,
    fade_size: usize,
    border: usize,
}

impl OverlapPlan {
    /// `step = C / N`, `fade_size = C / 10`, `border = C − step`.
    ///
    /// # Errors
    /// `InvalidOverlapPlan` when `num_overlap == 0` or the derived geometry
    /// fails [`OverlapPlan::from_parts`] validation.
    pub fn new(chunk_size: usize, num_overlap: usize) -> Result<Self> {
        if num_overlap == 0 {
            return Err(SeparationError::InvalidOverlapPlan(
                "num_overlap must be at least 1".into(),
            ));
        }
        let step = chunk_size / num_overlap;
        Self::from_parts(chunk_size, step, chunk_size / 10, chunk_size.saturating_sub(step))
    }

    /// Build a plan from explicit parameters.
    ///
    /// Every chunk start must land in the flat body of the previous chunk
    /// (`step + fade_size <= chunk_size`), which keeps `counter` positive
    /// everywhere.
    ///
    /// # Errors
    /// `InvalidOverlapPlan` on a zero chunk/step, a step longer than the
    /// chunk, fades reaching half the chunk, or a step that would land a
    /// chunk start inside the previous chunk's fade-out.
    pub fn from_parts(
        chunk_size: usize,
        step: usize,
        fade_size: usize,
        border: usize,
    ) -> Result<Self> {
        let invalid = |msg: String| Err(SeparationError::InvalidOverlapPlan(msg));
        if chunk_size == 0 {
            return invalid("chunk_size must be positive".into());
        }
        if step == 0 {
            return invalid(format!("step is zero for chunk_size={chunk_size}"));
        }
        if step > chunk_size {
            return invalid(format!(
                "step {step} exceeds chunk_size {chunk_size}; samples would be skipped"
            ));
        }
        if fade_size > 0 && fade_size * 2 >= chunk_size {
            return invalid(format!(
                "fade_size {fade_size} must be under half of chunk_size {chunk_size}"
            ));
        }
        if step + fade_size > chunk_size {
            return invalid(format!(
                "step {step} + fade_size {fade_size} exceeds chunk_size {chunk_size}; \
                 chunk starts would get zero weight (raise num_overlap)"
            ));
        }
        Ok(Self {
            chunk_size,
            step,
            fade_size,
            border,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn fade_size(&self) -> usize {
        self.fade_size
    }

    pub fn border(&self) -> usize {
        self.border
    }

    /// Whether a waveform of `frames` samples gets reflect-padded.
    pub fn applies_border(&self, frames: usize) -> bool {
        self.border > 0 && frames > 2 * self.border
    }

    /// Length after optional border padding.
    pub fn padded_len(&self, frames: usize) -> usize {
        if self.applies_border(frames) {
            frames + 2 * self.border
        } else {
            frames
        }
    }

    /// Number of `infer_fn` calls needed for a waveform of `frames` samples.
    pub fn chunk_count(&self, frames: usize) -> usize {
        self.padded_len(frames).div_ceil(self.step)
    }
}

/// Run `infer_fn` over every chunk of `waveform` and reconstruct the
/// continuous estimate.
///
/// `infer_fn` receives a `[channels, chunk_size]` buffer and must return one
/// of the same shape.
///
/// # Errors
/// Any error from `infer_fn` aborts the whole operation and is returned
/// unchanged; no partial output is produced. A shape mismatch from
/// `infer_fn` is an `Inference` error.
pub fn process<F>(waveform: &Waveform, plan: &OverlapPlan, infer_fn: F) -> Result<Waveform>
where
    F: FnMut(&Array2<f32>) -> Result<Array2<f32>>,
{
    process_with_progress(waveform, plan, infer_fn, |_, _| {})
}

/// [`process`] with a `(chunks_done, chunks_total)` callback after each chunk.
pub fn process_with_progress<F, P>(
    waveform: &Waveform,
    plan: &OverlapPlan,
    mut infer_fn: F,
    mut progress: P,
) -> Result<Waveform>
where
    F: FnMut(&Array2<f32>) -> Result<Array2<f32>>,
    P: FnMut(usize, usize),
{
    let frames = waveform.frames();
    let padded = plan.applies_border(frames);
    let mix = if padded {
        reflect_pad(waveform.samples().view(), plan.border, plan.border)
    } else {
        waveform.samples().clone()
    };

    let chunk_size = plan.chunk_size;
    let total_length = mix.ncols();
    let total_chunks = plan.chunk_count(frames);

    let envelope = window(chunk_size, plan.fade_size);
    let mut head_envelope = envelope.clone();
    head_envelope
        .slice_mut(s![..plan.fade_size])
        .fill(1.0);

    let mut result = Array2::<f32>::zeros(mix.raw_dim());
    let mut counter = Array2::<f32>::zeros(mix.raw_dim());

    debug!(
        frames,
        padded,
        total_length,
        chunk_size,
        step = plan.step,
        total_chunks,
        "overlap-add start"
    );

    for (n, start) in (0..total_length).step_by(plan.step).enumerate() {
        let end = (start + chunk_size).min(total_length);
        let length = end - start;

        let part = mix.slice(s![.., start..end]);
        let input = if length < chunk_size {
            pad_tail(part, chunk_size)
        } else {
            part.to_owned()
        };

        let estimate = infer_fn(&input)?;
        if estimate.dim() != input.dim() {
            return Err(SeparationError::Inference(format!(
                "estimator returned shape {:?} for input {:?}",
                estimate.dim(),
                input.dim()
            )));
        }

        let env = if start == 0 {
            head_envelope.slice(s![..length])
        } else {
            envelope.slice(s![..length])
        };
        let weighted = &estimate.slice(s![.., ..length]) * &env;

        let mut acc = result.slice_mut(s![.., start..end]);
        acc += &weighted;
        let mut cnt = counter.slice_mut(s![.., start..end]);
        cnt += &env;

        progress(n + 1, total_chunks);
    }

    if let Some(pos) = counter.iter().position(|&c| c <= 0.0) {
        return Err(SeparationError::InvalidOverlapPlan(format!(
            "no chunk weight at flat index {pos}; plan {plan:?} leaves a gap"
        )));
    }

    result /= &counter;

    let output = if padded {
        result
            .slice(s![.., plan.border..total_length - plan.border])
            .to_owned()
    } else {
        result
    };

    Ok(Waveform::new(output, waveform.sample_rate()))
}

/// Pad the tail of a short chunk up to `target` frames.
///
/// Reflects when the chunk is long enough to mirror from, zero-fills
/// otherwise.
fn pad_tail(part: ArrayView2<f32>, target: usize) -> Array2<f32> {
    let length = part.ncols();
    let pad = target - length;
    if length > pad {
        reflect_pad(part, 0, pad)
    } else {
        let mut out = Array2::<f32>::zeros((part.nrows(), target));
        out.slice_mut(s![.., ..length]).assign(&part);
        out
    }
}

/// Mirror-pad along the frame axis without repeating the edge sample.
fn reflect_pad(samples: ArrayView2<f32>, left: usize, right: usize) -> Array2<f32> {
    let len = samples.ncols();
    let total = len + left + right;
    if len == 0 {
        return Array2::zeros((samples.nrows(), total));
    }
    Array2::from_shape_fn((samples.nrows(), total), |(c, i)| {
        let idx = reflect_index(i as isize - left as isize, len);
        samples[[c, idx]]
    })
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    if max == 0 {
        return 0;
    }
    while i < 0 || i > max {
        if i < 0 {
            i = -i;
        } else {
            i = 2 * max - i;
        }
    }
    i as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ramp_waveform(frames: usize) -> Waveform {
        Waveform::new(
            Array2::from_shape_fn((2, frames), |(c, f)| {
                ((f as f32 * 0.013).sin() + 0.1 * c as f32) * 0.5
            }),
            44_100,
        )
    }

    #[test]
    fn plan_derives_step_fade_and_border() {
        let plan = OverlapPlan::new(352_800, 4).unwrap();
        assert_eq!(plan.step(), 88_200);
        assert_eq!(plan.fade_size(), 35_280);
        assert_eq!(plan.border(), 264_600);
    }

    #[test]
    fn plan_rejects_step_landing_in_fade() {
        // N = 1 → step == chunk, every chunk start would sit at weight 0.
        let err = OverlapPlan::new(1_000, 1).unwrap_err();
        assert!(matches!(err, SeparationError::InvalidOverlapPlan(_)));
    }

    #[test]
    fn plan_rejects_step_longer_than_chunk() {
        assert!(OverlapPlan::from_parts(100, 101, 10, 0).is_err());
        assert!(OverlapPlan::from_parts(100, 0, 10, 0).is_err());
        assert!(OverlapPlan::from_parts(0, 1, 0, 0).is_err());
        assert!(OverlapPlan::from_parts(100, 10, 50, 0).is_err());
    }

    #[test]
    fn tiny_chunk_without_fade_allows_single_coverage() {
        let plan = OverlapPlan::new(8, 1).unwrap();
        assert_eq!(plan.fade_size(), 0);
        let wf = ramp_waveform(30);
        let out = process(&wf, &plan, |c| Ok(c.clone())).unwrap();
        assert_eq!(out, wf);
    }

    #[test]
    fn reflect_pad_mirrors_without_edge_repeat() {
        let x = array![[1.0f32, 2.0, 3.0, 4.0]];
        let padded = reflect_pad(x.view(), 2, 2);
        assert_eq!(padded, array![[3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]]);
    }

    #[test]
    fn short_tail_is_zero_padded() {
        let x = array![[1.0f32, 2.0]];
        assert_eq!(pad_tail(x.view(), 6), array![[1.0, 2.0, 0.0, 0.0, 0.0, 0.0]]);
        let y = array![[1.0f32, 2.0, 3.0, 4.0]];
        assert_eq!(pad_tail(y.view(), 6), array![[1.0, 2.0, 3.0, 4.0, 3.0, 2.0]]);
    }

    #[test]
    fn identity_inference_reconstructs_input() {
        let plan = OverlapPlan::new(200, 4).unwrap();
        for frames in [50, 199, 200, 401, 1_000, 1_337] {
            let wf = ramp_waveform(frames);
            let out = process(&wf, &plan, |chunk| Ok(chunk.clone())).unwrap();
            assert_eq!(out.frames(), frames);
            for (a, b) in out.samples().iter().zip(wf.samples().iter()) {
                approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn ten_second_stereo_clip_with_two_second_chunks() {
        let rate = 44_100;
        let plan = OverlapPlan::new(2 * rate, 4).unwrap();
        let frames = 10 * rate;
        assert_eq!(plan.chunk_count(frames), 26);

        let mut calls = 0;
        let out = process(&ramp_waveform(frames), &plan, |c| {
            calls += 1;
            Ok(c.clone())
        })
        .unwrap();
        assert_eq!(calls, 26);
        assert_eq!(out.channels(), 2);
        assert_eq!(out.frames(), frames);
    }

    #[test]
    fn border_stripping_restores_exact_length() {
        let plan = OverlapPlan::new(100, 4).unwrap();
        let frames = 2 * plan.border() + 1;
        assert!(plan.applies_border(frames));
        let out = process(&ramp_waveform(frames), &plan, |c| Ok(c.clone())).unwrap();
        assert_eq!(out.frames(), frames);

        // At exactly 2 × border no padding happens, length still matches.
        let frames = 2 * plan.border();
        assert!(!plan.applies_border(frames));
        let out = process(&ramp_waveform(frames), &plan, |c| Ok(c.clone())).unwrap();
        assert_eq!(out.frames(), frames);
    }

    #[test]
    fn flattened_head_fade_never_reaches_padded_output() {
        // step 100, fade 40, border 300
        let plan = OverlapPlan::new(400, 4).unwrap();
        let frames = 1_000;
        assert!(plan.applies_border(frames));

        // Each call returns its own index so the result depends on the weights.
        let mut calls = 0.0f32;
        let out = process(&ramp_waveform(frames), &plan, |c| {
            calls += 1.0;
            Ok(Array2::from_elem(c.raw_dim(), calls))
        })
        .unwrap();

        // Same accumulation with the unmodified envelope on every chunk.
        let total = frames + 2 * plan.border();
        let env = window(plan.chunk_size(), plan.fade_size());
        let mut num = vec![0.0f32; total];
        let mut den = vec![0.0f32; total];
        for (n, start) in (0..total).step_by(plan.step()).enumerate() {
            let end = (start + plan.chunk_size()).min(total);
            for i in start..end {
                num[i] += (n + 1) as f32 * env[i - start];
                den[i] += env[i - start];
            }
        }
        for f in 0..frames {
            let i = f + plan.border();
            let expected = num[i] / den[i];
            for c in 0..2 {
                approx::assert_abs_diff_eq!(out.samples()[[c, f]], expected, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn scaling_estimator_scales_output() {
        let plan = OverlapPlan::new(120, 3).unwrap();
        let wf = ramp_waveform(700);
        let out = process(&wf, &plan, |c| Ok(c * 0.5)).unwrap();
        for (a, b) in out.samples().iter().zip(wf.samples().iter()) {
            approx::assert_abs_diff_eq!(*a, *b * 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn estimator_failure_aborts_whole_run() {
        let plan = OverlapPlan::new(100, 4).unwrap();
        let mut calls = 0;
        let err = process(&ramp_waveform(1_000), &plan, |c| {
            calls += 1;
            if calls == 3 {
                Err(SeparationError::Inference("boom".into()))
            } else {
                Ok(c.clone())
            }
        })
        .unwrap_err();
        assert!(matches!(err, SeparationError::Inference(ref m) if m == "boom"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn wrong_shape_from_estimator_is_rejected() {
        let plan = OverlapPlan::new(100, 4).unwrap();
        let err = process(&ramp_waveform(300), &plan, |_| Ok(Array2::zeros((2, 10)))).unwrap_err();
        assert!(matches!(err, SeparationError::Inference(_)));
    }

    #[test]
    fn every_chunk_is_full_size_and_progress_counts_up() {
        let plan = OverlapPlan::new(100, 4).unwrap();
        let frames = 777;
        let mut seen = Vec::new();
        let mut shapes_ok = true;
        process_with_progress(
            &ramp_waveform(frames),
            &plan,
            |c| {
                shapes_ok &= c.dim() == (2, 100);
                Ok(c.clone())
            },
            |done, total| seen.push((done, total)),
        )
        .unwrap();
        assert!(shapes_ok);
        let expected = plan.chunk_count(frames);
        assert_eq!(seen.len(), expected);
        assert_eq!(seen.last(), Some(&(expected, expected)));
    }
}
