//! Channel and sample-rate normalisation using a rubato `SincFixedIn`
//! resampler.
//!
//! ## Design
//!
//! Source files arrive with any channel count at any rate. The estimator
//! needs stereo at one fixed rate. [`normalize`] does both in one pass:
//!
//! 1. Channels: mono is duplicated to two identical channels; more than two
//!    channels keeps the first two (deterministic, no mixing).
//! 2. Rate: when the source rate differs, the whole buffer is resampled and
//!    trimmed to exactly `round(frames × target / source)` frames.
//!
//! When source rate == target rate, `RateConverter` is a passthrough; no
//! rubato session is created at all.

use ndarray::{s, Array2};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::info;

use crate::audio::Waveform;
use crate::error::{Result, SeparationError};

/// Number of channels the estimator consumes.
pub const CANONICAL_CHANNELS: usize = 2;

/// Input frames per rubato call.
const RESAMPLE_CHUNK: usize = 4_096;

/// Bring an arbitrary waveform to stereo at `canonical_rate`.
///
/// Pure transform: the input is left untouched.
///
/// # Errors
/// `UnsupportedAudioFormat` for a waveform with no channels or no frames, or
/// when rubato cannot be initialised for the requested ratio.
pub fn normalize(waveform: &Waveform, canonical_rate: u32) -> Result<Waveform> {
    if waveform.channels() == 0 || waveform.frames() == 0 {
        return Err(SeparationError::UnsupportedAudioFormat(format!(
            "empty audio ({} channels, {} frames)",
            waveform.channels(),
            waveform.frames()
        )));
    }
    if waveform.sample_rate() == 0 {
        return Err(SeparationError::UnsupportedAudioFormat(
            "source sample rate is zero".into(),
        ));
    }

    let stereo = to_stereo(waveform.samples());

    let mut rc = RateConverter::new(waveform.sample_rate(), canonical_rate, CANONICAL_CHANNELS)?;
    if rc.is_passthrough() {
        return Ok(Waveform::new(stereo, canonical_rate));
    }
    let resampled = rc.process_all(&stereo)?;
    Ok(Waveform::new(resampled, canonical_rate))
}

/// Mono → duplicated stereo, stereo → unchanged, >2 channels → first two.
fn to_stereo(samples: &Array2<f32>) -> Array2<f32> {
    match samples.nrows() {
        1 => {
            let row = samples.row(0);
            Array2::from_shape_fn((CANONICAL_CHANNELS, samples.ncols()), |(_, f)| row[f])
        }
        2 => samples.clone(),
        _ => samples.slice(s![..CANONICAL_CHANNELS, ..]).to_owned(),
    }
}

/// Converts planar f32 audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<SincFixedIn<f32>>,
    ratio: f64,
    channels: usize,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `UnsupportedAudioFormat` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, channels: usize) -> Result<Self> {
        let ratio = target_rate as f64 / source_rate as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                ratio,
                channels,
            });
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            params,
            RESAMPLE_CHUNK,
            channels,
        )
        .map_err(|e| SeparationError::UnsupportedAudioFormat(format!("resampler init: {e}")))?;

        info!(
            source_rate,
            target_rate,
            channels,
            "resampling enabled from={} to={}",
            source_rate,
            target_rate
        );

        Ok(Self {
            resampler: Some(resampler),
            ratio,
            channels,
        })
    }

    /// Resample a complete `[channels, frames]` buffer.
    ///
    /// The resampler's group delay is trimmed from the front and the tail is
    /// flushed, so the output holds exactly `round(frames × ratio)` frames.
    pub fn process_all(&mut self, input: &Array2<f32>) -> Result<Array2<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(input.clone());
        };

        let frames = input.ncols();
        let expected = (frames as f64 * self.ratio).round() as usize;
        let delay = resampler.output_delay();
        let planar: Vec<Vec<f32>> = input.rows().into_iter().map(|r| r.to_vec()).collect();

        let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); self.channels];
        let mut out_buf = vec![vec![0f32; resampler.output_frames_max()]; self.channels];
        let map_err = |e: rubato::ResampleError| {
            SeparationError::UnsupportedAudioFormat(format!("resampler process: {e}"))
        };

        let mut pos = 0usize;
        while pos + resampler.input_frames_next() <= frames {
            let n = resampler.input_frames_next();
            let slices: Vec<&[f32]> = planar.iter().map(|c| &c[pos..pos + n]).collect();
            let (_, produced) = resampler
                .process_into_buffer(&slices, &mut out_buf, None)
                .map_err(map_err)?;
            append(&mut out, &out_buf, produced);
            pos += n;
        }

        if pos < frames {
            let slices: Vec<&[f32]> = planar.iter().map(|c| &c[pos..]).collect();
            let (_, produced) = resampler
                .process_partial_into_buffer(Some(slices.as_slice()), &mut out_buf, None)
                .map_err(map_err)?;
            append(&mut out, &out_buf, produced);
        }

        // Flush the filter tail until the delayed signal is fully out.
        while out[0].len() < expected + delay {
            let (_, produced) = resampler
                .process_partial_into_buffer(None::<&[&[f32]]>, &mut out_buf, None)
                .map_err(map_err)?;
            if produced == 0 {
                break;
            }
            append(&mut out, &out_buf, produced);
        }

        let mut result = Array2::<f32>::zeros((self.channels, expected));
        for (c, channel) in out.iter().enumerate() {
            let available = channel.len().saturating_sub(delay).min(expected);
            for f in 0..available {
                result[[c, f]] = channel[delay + f];
            }
        }
        Ok(result)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

fn append(out: &mut [Vec<f32>], buf: &[Vec<f32>], produced: usize) {
    for (dst, src) in out.iter_mut().zip(buf) {
        dst.extend_from_slice(&src[..produced]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(channels: usize, frames: usize, rate: u32) -> Waveform {
        Waveform::new(
            Array2::from_shape_fn((channels, frames), |(c, f)| {
                (2.0 * std::f32::consts::PI * 440.0 * f as f32 / rate as f32).sin()
                    * (0.2 + 0.1 * c as f32)
            }),
            rate,
        )
    }

    #[test]
    fn passthrough_identity() {
        let wf = tone(2, 480, 44_100);
        let out = normalize(&wf, 44_100).unwrap();
        assert_eq!(out, wf);
    }

    #[test]
    fn mono_is_duplicated_to_stereo() {
        let wf = tone(1, 1_000, 44_100);
        let out = normalize(&wf, 44_100).unwrap();
        assert_eq!(out.channels(), 2);
        assert_eq!(out.samples().row(0), out.samples().row(1));
        assert_eq!(out.samples().row(0), wf.samples().row(0));
    }

    #[test]
    fn extra_channels_keep_first_two() {
        let wf = tone(6, 300, 44_100);
        let out = normalize(&wf, 44_100).unwrap();
        assert_eq!(out.channels(), 2);
        assert_eq!(out.samples().row(0), wf.samples().row(0));
        assert_eq!(out.samples().row(1), wf.samples().row(1));
    }

    #[test]
    fn ratio_48k_to_44k1_exact_length() {
        let wf = tone(2, 48_000, 48_000);
        let out = normalize(&wf, 44_100).unwrap();
        assert_eq!(out.sample_rate(), 44_100);
        assert_eq!(out.frames(), 44_100);
        assert_eq!(out.channels(), 2);
    }

    #[test]
    fn upsampling_preserves_signal_energy() {
        let wf = tone(2, 22_050, 22_050);
        let out = normalize(&wf, 44_100).unwrap();
        assert_eq!(out.frames(), 44_100);
        // Mid-buffer amplitude survives the band-limited filter.
        let peak = out
            .samples()
            .row(0)
            .iter()
            .skip(10_000)
            .take(10_000)
            .fold(0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.2).abs() < 0.02, "peak={peak}");
    }

    #[test]
    fn empty_audio_is_rejected() {
        let wf = Waveform::new(Array2::zeros((2, 0)), 44_100);
        let err = normalize(&wf, 44_100).unwrap_err();
        assert!(matches!(err, SeparationError::UnsupportedAudioFormat(_)));
    }
}
