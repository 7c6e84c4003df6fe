//! Video encoder collaborator.
//!
//! The engine only needs `encode(frames, frame_rate, output)`. The
//! production encoder shells out to FFmpeg's concat demuxer; the scripted
//! encoder is a deterministic double for tests and dry runs.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use thiserror::Error;

/// Why an encode attempt produced no usable artifact.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no frames to encode")]
    NoFrames,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder exited with {status}: {stderr_tail}")]
    Exit { status: String, stderr_tail: String },

    #[error("encoder produced an empty file at {0}")]
    EmptyOutput(PathBuf),

    #[error("encoder rejected input: {0}")]
    Rejected(String),
}

/// Turns an ordered frame sequence into one video file.
pub trait VideoEncoder {
    fn encode(&self, frames: &[PathBuf], frame_rate: u32, output: &Path)
        -> Result<(), EncodeError>;
}

/// Size of `output`, failing on a missing or zero-byte file.
pub fn ensure_output(output: &Path) -> Result<u64, EncodeError> {
    let len = std::fs::metadata(output)
        .map_err(|source| EncodeError::Io {
            path: output.to_path_buf(),
            source,
        })?
        .len();
    if len == 0 {
        return Err(EncodeError::EmptyOutput(output.to_path_buf()));
    }
    Ok(len)
}

// ---------------------------------------------------------------------------
// FFmpeg
// ---------------------------------------------------------------------------

const STDERR_TAIL_LINES: usize = 8;

/// `ffmpeg -f concat -safe 0 -i <list> -vf fps=<rate> -c:v libx264 -pix_fmt yuv420p -y <out>`
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// One `file '<path>'` line per frame, single quotes escaped for the demuxer.
pub fn concat_list(frames: &[PathBuf]) -> String {
    let mut list = String::new();
    for frame in frames {
        let escaped = frame.display().to_string().replace('\'', r"'\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }
    list
}

impl VideoEncoder for FfmpegEncoder {
    fn encode(
        &self,
        frames: &[PathBuf],
        frame_rate: u32,
        output: &Path,
    ) -> Result<(), EncodeError> {
        if frames.is_empty() {
            return Err(EncodeError::NoFrames);
        }
        let list_path = output.with_extension("frames.txt");
        std::fs::write(&list_path, concat_list(frames)).map_err(|source| EncodeError::Io {
            path: list_path.clone(),
            source,
        })?;

        tracing::info!(
            frames = frames.len(),
            frame_rate,
            output = %output.display(),
            "running ffmpeg"
        );
        let result = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .arg("-vf")
            .arg(format!("fps={frame_rate}"))
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-y"])
            .arg(output)
            .output();
        let _ = std::fs::remove_file(&list_path);

        let out = result.map_err(|source| EncodeError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            return Err(EncodeError::Exit {
                status: out.status.to_string(),
                stderr_tail: tail,
            });
        }
        let bytes = ensure_output(output)?;
        tracing::info!(output = %output.display(), bytes, "encoded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted double
// ---------------------------------------------------------------------------

/// What [`ScriptedEncoder`] does on each call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Write these bytes to the output.
    Write(Vec<u8>),
    /// Create an empty output file.
    Empty,
    /// Fail with [`EncodeError::Rejected`].
    Fail(String),
}

/// Encoder double that records its inputs and follows a fixed script.
#[derive(Debug)]
pub struct ScriptedEncoder {
    script: Script,
    calls: Mutex<Vec<Vec<PathBuf>>>,
}

impl ScriptedEncoder {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Writes `b"video"` on every call.
    pub fn succeeding() -> Self {
        Self::new(Script::Write(b"video".to_vec()))
    }

    /// Frame lists of every call so far.
    pub fn calls(&self) -> Vec<Vec<PathBuf>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl VideoEncoder for ScriptedEncoder {
    fn encode(&self, frames: &[PathBuf], _frame_rate: u32, output: &Path) -> Result<(), EncodeError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(frames.to_vec());
        if frames.is_empty() {
            return Err(EncodeError::NoFrames);
        }
        let io = |source: std::io::Error| EncodeError::Io {
            path: output.to_path_buf(),
            source,
        };
        match &self.script {
            Script::Write(bytes) => std::fs::write(output, bytes).map_err(io),
            Script::Empty => std::fs::write(output, b"").map_err(io),
            Script::Fail(reason) => Err(EncodeError::Rejected(reason.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn concat_list_escapes_single_quotes() {
        let list = concat_list(&[PathBuf::from("/m/a.jpg"), PathBuf::from("/m/it's.jpg")]);
        assert_eq!(list, "file '/m/a.jpg'\nfile '/m/it'\\''s.jpg'\n");
    }

    #[test]
    fn empty_output_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("v.mp4");
        std::fs::write(&out, b"").unwrap();
        assert!(matches!(ensure_output(&out), Err(EncodeError::EmptyOutput(_))));
        std::fs::write(&out, b"x").unwrap();
        assert_eq!(ensure_output(&out).unwrap(), 1);
    }

    #[test]
    fn missing_ffmpeg_is_a_spawn_error() {
        let tmp = TempDir::new().unwrap();
        let encoder = FfmpegEncoder::new(tmp.path().join("no-such-ffmpeg"));
        let err = encoder
            .encode(&[tmp.path().join("a.jpg")], 24, &tmp.path().join("v.mp4"))
            .unwrap_err();
        assert!(matches!(err, EncodeError::Spawn { .. }), "got {err:?}");
        assert!(!tmp.path().join("v.frames.txt").exists());
    }

    #[test]
    fn scripted_encoder_records_frames() {
        let tmp = TempDir::new().unwrap();
        let encoder = ScriptedEncoder::succeeding();
        let frames = vec![tmp.path().join("a.jpg")];
        encoder.encode(&frames, 24, &tmp.path().join("v.mp4")).unwrap();
        assert_eq!(encoder.calls(), vec![frames]);
        assert_eq!(std::fs::read(tmp.path().join("v.mp4")).unwrap(), b"video");
    }
}
