//! Backend throughput benchmark.
//!
//! Runs the overlap-add stage over a fixed stereo signal once per backend
//! and reports wall time and real-time factor as JSON.

use std::path::PathBuf;
use std::time::Instant;

use ndarray::Array2;
use serde::Serialize;
use vocalsplit_core::{
    audio::{self, resample},
    inference::selector,
    overlap, BackendConfig, BackendKind, OverlapPlan, Waveform,
};

#[derive(Debug)]
struct Args {
    input: Option<PathBuf>,
    seconds: u32,
    iterations: usize,
    backends: Vec<BackendKind>,
    chunk_size: usize,
    num_overlap: usize,
    sample_rate: u32,
    backend: BackendConfig,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackendResult {
    backend: BackendKind,
    label: Option<String>,
    error: Option<String>,
    chunks: usize,
    runs_ms: Vec<f64>,
    p50_ms: f64,
    realtime_factor: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    source: String,
    duration_secs: f64,
    sample_rate: u32,
    chunk_size: usize,
    num_overlap: usize,
    iterations: usize,
    results: Vec<BackendResult>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn parse_backend(name: &str) -> Result<BackendKind, String> {
    match name.trim().to_ascii_lowercase().as_str() {
        "remote" => Ok(BackendKind::Remote),
        "cpu" | "cpu-optimized" => Ok(BackendKind::CpuOptimized),
        "reference" | "accelerated" | "cuda" => Ok(BackendKind::Accelerated),
        "stub" => Ok(BackendKind::Stub),
        other => Err(format!("unknown backend: {other}")),
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        input: None,
        seconds: 30,
        iterations: 1,
        backends: vec![BackendKind::CpuOptimized, BackendKind::Accelerated],
        chunk_size: vocalsplit_core::engine::DEFAULT_CHUNK_SIZE,
        num_overlap: vocalsplit_core::engine::DEFAULT_NUM_OVERLAP,
        sample_rate: vocalsplit_core::engine::DEFAULT_SAMPLE_RATE,
        backend: BackendConfig::default(),
        output: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| it.next().ok_or_else(|| format!("missing value for {flag}"));
        match arg.as_str() {
            "--input" => args.input = Some(PathBuf::from(value("--input")?)),
            "--seconds" => {
                args.seconds = value("--seconds")?
                    .parse::<u32>()
                    .map_err(|_| "invalid value for --seconds".to_string())?
                    .clamp(1, 600);
            }
            "--iterations" => {
                args.iterations = value("--iterations")?
                    .parse::<usize>()
                    .map_err(|_| "invalid value for --iterations".to_string())?
                    .clamp(1, 20);
            }
            "--backends" => {
                args.backends = value("--backends")?
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(parse_backend)
                    .collect::<Result<_, _>>()?;
            }
            "--chunk-size" => {
                args.chunk_size = value("--chunk-size")?
                    .parse()
                    .map_err(|_| "invalid value for --chunk-size".to_string())?;
            }
            "--overlap" => {
                args.num_overlap = value("--overlap")?
                    .parse()
                    .map_err(|_| "invalid value for --overlap".to_string())?;
            }
            "--remote-url" => args.backend.remote_url = Some(value("--remote-url")?),
            "--model-dir" => args.backend.model_dir = PathBuf::from(value("--model-dir")?),
            "--model" => args.backend.model_name = value("--model")?,
            "--threads" => {
                args.backend.num_threads = Some(
                    value("--threads")?
                        .parse()
                        .map_err(|_| "invalid value for --threads".to_string())?,
                );
            }
            "--quantized" => args.backend.quantized = true,
            "--output" => args.output = Some(PathBuf::from(value("--output")?)),
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p vocalsplit-core --features onnx --bin benchmark -- \\
  [--input <audio>] [--seconds <n>] [--iterations <n>] \\
  [--backends remote,cpu,reference,stub] [--chunk-size <n>] [--overlap <n>] \\
  [--remote-url <url>] [--model-dir <dir>] [--model <name>] [--threads <n>] \\
  [--quantized] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

/// Two detuned tones with a slow amplitude wobble, distinct per channel.
fn synth_signal(seconds: u32, sample_rate: u32) -> Waveform {
    let frames = (seconds * sample_rate) as usize;
    let rate = sample_rate as f32;
    let samples = Array2::from_shape_fn((2, frames), |(c, i)| {
        let t = i as f32 / rate;
        let f = if c == 0 { 220.0 } else { 233.1 };
        let env = 0.5 + 0.5 * (t * 0.7).sin();
        0.3 * env * (std::f32::consts::TAU * f * t).sin()
            + 0.1 * (std::f32::consts::TAU * 3.0 * f * t).sin()
    });
    Waveform::new(samples, sample_rate)
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let plan = OverlapPlan::new(args.chunk_size, args.num_overlap).map_err(|e| e.to_string())?;

    let (source, mix) = match &args.input {
        Some(path) => {
            let decoded = audio::decode_file(path).map_err(|e| e.to_string())?;
            let mix = resample::normalize(&decoded, args.sample_rate).map_err(|e| e.to_string())?;
            (path.display().to_string(), mix)
        }
        None => (
            format!("synthetic {}s", args.seconds),
            synth_signal(args.seconds, args.sample_rate),
        ),
    };
    let duration_secs = mix.duration_secs();
    let chunks = plan.chunk_count(mix.frames());
    println!(
        "Benchmarking {} backend(s) on {source} ({duration_secs:.1}s, {chunks} chunks)",
        args.backends.len()
    );

    let mut results = Vec::with_capacity(args.backends.len());
    for kind in &args.backends {
        let handle = match selector::construct(*kind, &args.backend, args.sample_rate) {
            Ok(h) => h,
            Err(e) => {
                println!("  {kind}: unavailable ({e})");
                results.push(BackendResult {
                    backend: *kind,
                    label: None,
                    error: Some(e.to_string()),
                    chunks,
                    runs_ms: Vec::new(),
                    p50_ms: 0.0,
                    realtime_factor: 0.0,
                });
                continue;
            }
        };
        let label = handle.descriptor().label;

        let mut runs_ms = Vec::with_capacity(args.iterations);
        let mut error = None;
        for _ in 0..args.iterations {
            let started = Instant::now();
            let outcome = overlap::process(&mix, &plan, |chunk| handle.0.lock().infer(chunk));
            if let Err(e) = outcome {
                error = Some(e.to_string());
                break;
            }
            runs_ms.push(started.elapsed().as_secs_f64() * 1_000.0);
        }

        let p50_ms = percentile(&runs_ms, 0.50);
        let realtime_factor = if duration_secs > 0.0 {
            p50_ms / 1_000.0 / duration_secs
        } else {
            0.0
        };
        println!("  {kind} [{label}]: p50={p50_ms:.1}ms rtf={realtime_factor:.3}");
        results.push(BackendResult {
            backend: *kind,
            label: Some(label),
            error,
            chunks,
            runs_ms,
            p50_ms,
            realtime_factor,
        });
    }

    let summary = Summary {
        source,
        duration_secs,
        sample_rate: args.sample_rate,
        chunk_size: plan.chunk_size(),
        num_overlap: args.num_overlap,
        iterations: args.iterations,
        results,
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
