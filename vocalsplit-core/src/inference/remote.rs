//! Remote estimator: offloads inference to a GPU peer over HTTP.
//!
//! Peer endpoints:
//!
//! | Method | Path                    | Body                                             |
//! |--------|-------------------------|--------------------------------------------------|
//! | GET    | `/health`               | probed once at construction                      |
//! | POST   | `/infer`                | `{sampleRate, channels, samples, data: [[f32]]}` |
//! | POST   | `/separate-vocals-cuda` | multipart `file`, whole-file mode only           |
//!
//! `/infer` answers `{data: [[f32]]}` with the request's shape. The whole-file
//! endpoint answers `{vocals_url, instrumental_url, sample_rate}` where both
//! URLs are relative to the peer.

use std::path::Path;
use std::time::{Duration, Instant};

use ndarray::Array2;
use reqwest::blocking::{multipart, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::SeparatedStems;
use crate::error::{Result, SeparationError};
use crate::inference::{BackendDescriptor, BackendKind, Estimator, RemoteMode};

const PROBE_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InferRequest {
    sample_rate: u32,
    channels: usize,
    samples: usize,
    data: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct InferResponse {
    data: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct WholeFileResponse {
    vocals_url: String,
    instrumental_url: String,
    #[serde(default = "default_peer_rate")]
    sample_rate: u32,
}

fn default_peer_rate() -> u32 {
    44_100
}

fn remote_error(e: impl std::fmt::Display) -> SeparationError {
    SeparationError::RemoteInference(e.to_string())
}

pub struct RemoteEstimator {
    client: Client,
    base_url: String,
    mode: RemoteMode,
    sample_rate: u32,
}

impl RemoteEstimator {
    /// Build a client and probe `{base_url}/health`.
    ///
    /// # Errors
    /// `RemoteUnreachable` when the client cannot be built, the peer does not
    /// answer, or the probe returns a non-success status.
    pub fn connect(
        base_url: &str,
        timeout_secs: u64,
        mode: RemoteMode,
        sample_rate: u32,
    ) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(SeparationError::RemoteUnreachable("empty remote URL".into()));
        }
        let timeout = Duration::from_secs(timeout_secs.max(1));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SeparationError::RemoteUnreachable(e.to_string()))?;

        let probe_url = format!("{base_url}/health");
        let response = client
            .get(&probe_url)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS).min(timeout))
            .send()
            .map_err(|e| SeparationError::RemoteUnreachable(format!("{probe_url}: {e}")))?;
        if !response.status().is_success() {
            return Err(SeparationError::RemoteUnreachable(format!(
                "{probe_url} returned {}",
                response.status()
            )));
        }
        info!(url = %base_url, timeout_secs = timeout.as_secs(), mode = ?mode, "remote estimator reachable");

        Ok(Self {
            client,
            base_url,
            mode,
            sample_rate,
        })
    }

    fn peer_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let bytes = self
            .client
            .get(self.peer_url(url))
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(remote_error)?;
        std::fs::write(dest, &bytes)?;
        debug!(dest = ?dest, bytes = bytes.len(), "downloaded remote stem");
        Ok(())
    }

    fn upload_whole_file(&self, input: &Path, out_dir: &Path) -> Result<SeparatedStems> {
        let started = Instant::now();
        let bytes = std::fs::read(input)?;
        let file_name = input
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(remote_error)?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.peer_url("/separate-vocals-cuda"))
            .multipart(form)
            .send()
            .map_err(remote_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(SeparationError::RemoteInference(format!(
                "remote separation failed ({status}): {body}"
            )));
        }
        let result: WholeFileResponse = response.json().map_err(remote_error)?;

        let stems = SeparatedStems {
            vocals_path: out_dir.join("vocals.wav"),
            instrumental_path: out_dir.join("instrumental.wav"),
            sample_rate: result.sample_rate,
        };
        self.download(&result.vocals_url, &stems.vocals_path)?;
        self.download(&result.instrumental_url, &stems.instrumental_path)?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            sample_rate = stems.sample_rate,
            "remote whole-file separation complete"
        );
        Ok(stems)
    }
}

impl Estimator for RemoteEstimator {
    fn infer(&mut self, chunk: &Array2<f32>) -> Result<Array2<f32>> {
        let (channels, samples) = chunk.dim();
        let request = InferRequest {
            sample_rate: self.sample_rate,
            channels,
            samples,
            data: chunk.rows().into_iter().map(|r| r.to_vec()).collect(),
        };

        let response = self
            .client
            .post(self.peer_url("/infer"))
            .json(&request)
            .send()
            .map_err(remote_error)?;
        if !response.status().is_success() {
            return Err(SeparationError::RemoteInference(format!(
                "/infer returned {}",
                response.status()
            )));
        }
        let body: InferResponse = response.json().map_err(remote_error)?;

        if body.data.len() != channels || body.data.iter().any(|row| row.len() != samples) {
            return Err(SeparationError::RemoteInference(format!(
                "peer returned {} channels, expected {channels}x{samples}",
                body.data.len()
            )));
        }
        let flat: Vec<f32> = body.data.into_iter().flatten().collect();
        Array2::from_shape_vec((channels, samples), flat).map_err(remote_error)
    }

    fn descriptor(&self) -> BackendDescriptor {
        let label = match self.mode {
            RemoteMode::Chunk => "remote (chunked)",
            RemoteMode::WholeFile => "remote (whole file)",
        };
        BackendDescriptor::new(BackendKind::Remote, label, self.base_url.clone())
    }

    fn separate_file(&mut self, input: &Path, out_dir: &Path) -> Option<Result<SeparatedStems>> {
        match self.mode {
            RemoteMode::Chunk => None,
            RemoteMode::WholeFile => Some(self.upload_whole_file(input, out_dir)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn read_request(stream: &TcpStream) -> (String, Vec<u8>) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let path = line.split_whitespace().nth(1).unwrap().to_string();
        let mut len = 0usize;
        let mut chunked = false;
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).unwrap();
            if header == "\r\n" || header.is_empty() {
                break;
            }
            let header = header.to_ascii_lowercase();
            if let Some(v) = header.strip_prefix("content-length:") {
                len = v.trim().parse().unwrap();
            }
            if header.starts_with("transfer-encoding:") && header.contains("chunked") {
                chunked = true;
            }
        }
        if !chunked {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).unwrap();
            return (path, body);
        }
        let mut body = Vec::new();
        loop {
            let mut size = String::new();
            reader.read_line(&mut size).unwrap();
            let size = usize::from_str_radix(size.trim(), 16).unwrap();
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            if size == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..size]);
        }
        (path, body)
    }

    /// Minimal HTTP/1.1 peer answering `requests` requests, one per connection.
    fn fake_peer<F>(requests: usize, handler: F) -> String
    where
        F: Fn(&str, &[u8]) -> (u16, Vec<u8>) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming().take(requests) {
                let mut stream = stream.unwrap();
                let (path, body) = read_request(&stream);
                let (status, reply) = handler(&path, &body);
                write!(
                    stream,
                    "HTTP/1.1 {status} STATUS\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n",
                    reply.len()
                )
                .unwrap();
                stream.write_all(&reply).unwrap();
            }
        });
        format!("http://{addr}")
    }

    fn echo_peer(path: &str, body: &[u8]) -> (u16, Vec<u8>) {
        match path {
            "/health" => (200, b"{}".to_vec()),
            "/infer" => {
                let req: serde_json::Value = serde_json::from_slice(body).unwrap();
                let reply = serde_json::json!({ "data": req["data"] });
                (200, serde_json::to_vec(&reply).unwrap())
            }
            _ => (404, Vec::new()),
        }
    }

    #[test]
    fn unreachable_peer_is_a_construction_failure() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = RemoteEstimator::connect(
            &format!("http://127.0.0.1:{port}"),
            5,
            RemoteMode::Chunk,
            44_100,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SeparationError::RemoteUnreachable(_)));
        assert!(err.is_construction_failure());
    }

    #[test]
    fn unhealthy_peer_is_rejected() {
        let url = fake_peer(1, |_, _| (503, Vec::new()));
        let err = RemoteEstimator::connect(&url, 5, RemoteMode::Chunk, 44_100)
            .err()
            .unwrap();
        assert!(matches!(err, SeparationError::RemoteUnreachable(_)));
    }

    #[test]
    fn infer_round_trips_chunk_through_peer() {
        let url = fake_peer(2, echo_peer);
        let mut remote =
            RemoteEstimator::connect(&format!("{url}/"), 5, RemoteMode::Chunk, 44_100).unwrap();
        assert_eq!(remote.descriptor().detail, url);

        let chunk = Array2::from_shape_fn((2, 32), |(c, f)| c as f32 - f as f32 * 0.125);
        let out = remote.infer(&chunk).unwrap();
        assert_eq!(out, chunk);
        assert!(remote
            .separate_file(Path::new("x.wav"), Path::new("."))
            .is_none());
    }

    #[test]
    fn peer_error_is_a_runtime_failure() {
        let url = fake_peer(2, |path, _| match path {
            "/health" => (200, b"{}".to_vec()),
            _ => (500, b"{\"error\":\"oom\"}".to_vec()),
        });
        let mut remote = RemoteEstimator::connect(&url, 5, RemoteMode::Chunk, 44_100).unwrap();
        let err = remote.infer(&Array2::zeros((2, 8))).unwrap_err();
        assert!(matches!(err, SeparationError::RemoteInference(_)));
        assert!(!err.is_construction_failure());
    }

    #[test]
    fn wrong_shape_from_peer_is_rejected() {
        let url = fake_peer(2, |path, _| match path {
            "/health" => (200, b"{}".to_vec()),
            _ => (200, b"{\"data\":[[0.0]]}".to_vec()),
        });
        let mut remote = RemoteEstimator::connect(&url, 5, RemoteMode::Chunk, 44_100).unwrap();
        let err = remote.infer(&Array2::zeros((2, 8))).unwrap_err();
        assert!(matches!(err, SeparationError::RemoteInference(_)));
    }

    #[test]
    fn whole_file_mode_downloads_both_stems() {
        let url = fake_peer(4, |path, _| match path {
            "/health" => (200, b"{}".to_vec()),
            "/separate-vocals-cuda" => (
                200,
                br#"{"vocals_url":"/download/v","instrumental_url":"/download/i","sample_rate":48000}"#
                    .to_vec(),
            ),
            "/download/v" => (200, b"VOCALS".to_vec()),
            "/download/i" => (200, b"INSTR".to_vec()),
            _ => (404, Vec::new()),
        });
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("song.mp3");
        std::fs::write(&input, b"not really audio").unwrap();

        let mut remote = RemoteEstimator::connect(&url, 5, RemoteMode::WholeFile, 44_100).unwrap();
        let stems = remote.separate_file(&input, dir.path()).unwrap().unwrap();
        assert_eq!(stems.sample_rate, 48_000);
        assert_eq!(std::fs::read(&stems.vocals_path).unwrap(), b"VOCALS");
        assert_eq!(std::fs::read(&stems.instrumental_path).unwrap(), b"INSTR");
    }
}
