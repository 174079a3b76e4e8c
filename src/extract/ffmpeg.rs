//! FFmpeg stream-copy extraction
//!
//! Joins the source segments with the concat demuxer and copies the
//! requested range into the output. Because the plan hands us keyframe
//! aligned offsets, `inpoint`/`outpoint` cut exactly and no re-encode is
//! needed.

use super::primitive::SegmentExtractor;
use super::types::{ExtractError, ExtractionJob};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Runs the `ffmpeg` binary
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    binary: PathBuf,
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

fn seconds(ms: i64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

fn quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

/// Concat demuxer script for `job`
pub(crate) fn concat_list(job: &ExtractionJob) -> String {
    let last = job.sources.len().saturating_sub(1);
    let mut list = String::from("ffconcat version 1.0\n");
    for (i, source) in job.sources.iter().enumerate() {
        list.push_str(&format!("file {}\n", quote(source.as_str())));
        if i == 0 && job.start_offset_ms > 0 {
            list.push_str(&format!("inpoint {}\n", seconds(job.start_offset_ms)));
        }
        if i == last {
            list.push_str(&format!("outpoint {}\n", seconds(job.read_end_offset_ms)));
        }
    }
    list
}

/// Output written first, renamed into place on success
pub(crate) fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("partial-{}", name))
}

pub(crate) fn build_args(list: &Path, duration_ms: i64, staging: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list.to_string_lossy().into_owned(),
        "-t".to_string(),
        seconds(duration_ms),
        "-c".to_string(),
        "copy".to_string(),
        "-avoid_negative_ts".to_string(),
        "make_zero".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        staging.to_string_lossy().into_owned(),
    ]
}

#[async_trait]
impl SegmentExtractor for FfmpegExtractor {
    async fn extract(&self, job: &ExtractionJob) -> Result<(), ExtractError> {
        if job.sources.is_empty() {
            return Err(ExtractError::InvalidRequest(
                "extraction needs at least one segment".to_string(),
            ));
        }

        let mut list_file = tempfile::Builder::new()
            .prefix("replaycam-concat-")
            .suffix(".txt")
            .tempfile()?;
        list_file.write_all(concat_list(job).as_bytes())?;
        list_file.flush()?;

        let output = job.output.to_path();
        let staging = staging_path(&output);
        let args = build_args(list_file.path(), job.duration_ms, &staging);

        tracing::debug!(
            "Running {:?} over {} segment(s) into {:?}",
            self.binary,
            job.sources.len(),
            output
        );

        let result = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExtractError::Primitive(format!("Failed to start FFmpeg: {}", e)))?;

        if !result.status.success() {
            let _ = tokio::fs::remove_file(&staging).await;
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ExtractError::Primitive(format!(
                "FFmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        tokio::fs::rename(&staging, &output).await?;
        Ok(())
    }
}
