//! Waveform buffers and audio file I/O.
//!
//! A [`Waveform`] is planar: `[channels, frames]` in an `ndarray::Array2<f32>`.
//! Everything downstream of [`resample::normalize`] sees stereo audio at the
//! engine's canonical rate.
//!
//! Decoding goes through symphonia so any common container/codec can be fed
//! in. Stems are written back as 32-bit float WAV via hound.

pub mod resample;

use std::fs::File;
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use ndarray::{Array2, Axis};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::{Result, SeparationError};

/// Multi-channel f32 audio at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// `[channels, frames]`
    samples: Array2<f32>,
    sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Array2<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Build a planar waveform from interleaved frames.
    ///
    /// # Errors
    /// `UnsupportedAudioFormat` if `channels == 0` or the data length is not a
    /// whole number of frames.
    pub fn from_interleaved(data: &[f32], channels: usize, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(SeparationError::UnsupportedAudioFormat(
                "audio has no channels".into(),
            ));
        }
        if data.len() % channels != 0 {
            return Err(SeparationError::UnsupportedAudioFormat(format!(
                "{} samples is not a whole number of {}-channel frames",
                data.len(),
                channels
            )));
        }
        let frames = data.len() / channels;
        let samples = Array2::from_shape_fn((channels, frames), |(c, f)| data[f * channels + c]);
        Ok(Self::new(samples, sample_rate))
    }

    pub fn channels(&self) -> usize {
        self.samples.nrows()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.ncols()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &Array2<f32> {
        &self.samples
    }

    pub fn into_samples(self) -> Array2<f32> {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Interleave back to `[f0c0, f0c1, f1c0, ...]`.
    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.samples.len());
        for frame in self.samples.axis_iter(Axis(1)) {
            out.extend(frame.iter().copied());
        }
        out
    }

    /// `self − estimate`, elementwise. Used to derive the instrumental stem
    /// from the mix and the vocal estimate.
    ///
    /// # Errors
    /// `Inference` if the shapes or sample rates disagree.
    pub fn residual(&self, estimate: &Waveform) -> Result<Waveform> {
        if self.samples.dim() != estimate.samples.dim() || self.sample_rate != estimate.sample_rate
        {
            return Err(SeparationError::Inference(format!(
                "estimate shape {:?}@{}Hz does not match mix {:?}@{}Hz",
                estimate.samples.dim(),
                estimate.sample_rate,
                self.samples.dim(),
                self.sample_rate
            )));
        }
        Ok(Waveform::new(&self.samples - &estimate.samples, self.sample_rate))
    }
}

/// Decode an audio file of any format symphonia understands.
///
/// # Errors
/// `Io` if the file cannot be opened, `UnsupportedAudioFormat` if it cannot
/// be probed/decoded or holds no audio.
pub fn decode_file(path: &Path) -> Result<Waveform> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| SeparationError::UnsupportedAudioFormat(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| SeparationError::UnsupportedAudioFormat("no audio track found".into()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| SeparationError::UnsupportedAudioFormat("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| SeparationError::UnsupportedAudioFormat(e.to_string()))?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut buf_frames = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                warn!("error reading packet from {:?}: {e}", path);
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(SeparationError::UnsupportedAudioFormat(e.to_string())),
        };

        if sample_buf.is_none() || decoded.capacity() > buf_frames {
            let spec = *decoded.spec();
            channels = spec.channels.count();
            buf_frames = decoded.capacity();
            sample_buf = Some(SampleBuffer::new(buf_frames as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            interleaved.extend_from_slice(buf.samples());
        }
    }

    if interleaved.is_empty() {
        return Err(SeparationError::UnsupportedAudioFormat(format!(
            "{:?} decoded to zero samples",
            path
        )));
    }

    debug!(
        path = ?path,
        sample_rate,
        channels,
        frames = interleaved.len() / channels.max(1),
        "decoded audio"
    );
    Waveform::from_interleaved(&interleaved, channels, sample_rate)
}

/// Write a waveform as 32-bit float WAV.
pub fn write_wav(path: &Path, waveform: &Waveform) -> Result<()> {
    let channels = u16::try_from(waveform.channels()).map_err(|_| {
        SeparationError::UnsupportedAudioFormat(format!(
            "cannot write {} channels to WAV",
            waveform.channels()
        ))
    })?;
    let spec = WavSpec {
        channels,
        sample_rate: waveform.sample_rate(),
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec).map_err(wav_error)?;
    for sample in waveform.to_interleaved() {
        writer.write_sample(sample).map_err(wav_error)?;
    }
    writer.finalize().map_err(wav_error)?;
    Ok(())
}

fn wav_error(e: hound::Error) -> SeparationError {
    match e {
        hound::Error::IoError(io) => SeparationError::Io(io),
        other => SeparationError::Other(anyhow::anyhow!("wav write failed: {other}")),
    }
}
