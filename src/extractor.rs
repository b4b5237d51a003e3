#![forbid(unsafe_code)]

//! Boundary to the external extraction tool.
//!
//! Everything the proxy knows about a video comes from yt-dlp. Its JSON is
//! loosely typed (fields go missing or turn `null` depending on the video and
//! the yt-dlp version), so it is parsed into private mirror structs here and
//! converted into `RawStreamDescriptor`s before anything else sees it.

use std::{io, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{
    StreamExt,
    stream::{self, BoxStream},
};
use serde::Deserialize;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
};
use tokio_util::io::ReaderStream;

use crate::formats::{AudioQualityTier, RawStreamDescriptor};

/// Byte stream of a single encoded variant.
pub type MediaStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    /// The tool ran but reported a failure; the message is its own.
    #[error("{0}")]
    Failed(String),
    #[error("unreadable extractor output: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Metadata for one video, already reduced to typed descriptors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoDetails {
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration_seconds: u64,
    pub descriptors: Vec<RawStreamDescriptor>,
}

/// The seam to whatever knows how to talk to the video platform.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn fetch_details(&self, video_url: &str) -> Result<VideoDetails, ExtractorError>;

    /// Opens the byte stream for the variant named by `identifier`. The first
    /// chunk has already been received when this returns `Ok`.
    async fn open_stream(
        &self,
        video_url: &str,
        identifier: &str,
    ) -> Result<MediaStream, ExtractorError>;
}

/// Runs the yt-dlp binary as a subprocess.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    user_agent: String,
}

impl YtDlp {
    pub fn new(binary: PathBuf, user_agent: impl Into<String>) -> Self {
        Self {
            binary,
            user_agent: user_agent.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--user-agent")
            .arg(&self.user_agent)
            .arg("--no-warnings")
            .arg("--no-playlist")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Runs `--version` so a missing or broken install fails loudly at startup
    /// instead of on the first request.
    pub async fn version(&self) -> Result<String, ExtractorError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractorError::Failed(failure_message(
                &stderr,
                &output.status.to_string(),
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn spawn_error(&self, source: io::Error) -> ExtractorError {
        ExtractorError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn fetch_details(&self, video_url: &str) -> Result<VideoDetails, ExtractorError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-progress")
            .arg(video_url);

        tracing::debug!(url = video_url, "fetching metadata");
        let output = command
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractorError::Failed(failure_message(
                &stderr,
                &output.status.to_string(),
            )));
        }

        let info: InfoJson = serde_json::from_slice(&output.stdout)?;
        Ok(info.into_details())
    }

    async fn open_stream(
        &self,
        video_url: &str,
        identifier: &str,
    ) -> Result<MediaStream, ExtractorError> {
        let mut command = self.command();
        command
            .arg("--format")
            .arg(identifier)
            .arg("--output")
            .arg("-")
            .arg("--no-part")
            .arg("--quiet")
            .arg(video_url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(url = video_url, identifier, "opening stream");
        let mut child = command.spawn().map_err(|err| self.spawn_error(err))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractorError::Failed("extractor stdout unavailable".into()))?;
        // Drained continuously so a chatty process never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut body = process_stream(ProcessOutput {
            reader: ReaderStream::new(stdout),
            child,
            stderr,
            finished: false,
        });

        match body.next().await {
            Some(Ok(first)) => Ok(stream::once(async move { Ok(first) }).chain(body).boxed()),
            Some(Err(err)) => Err(ExtractorError::Failed(err.to_string())),
            None => Ok(stream::empty().boxed()),
        }
    }
}

struct ProcessOutput {
    reader: ReaderStream<ChildStdout>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

/// Yields stdout chunks, then surfaces a non-zero exit as a trailing error so
/// a truncated payload never looks like a complete one. Dropping the stream
/// drops the `Child`, which kills the process.
fn process_stream(output: ProcessOutput) -> MediaStream {
    stream::unfold(output, |mut output| async move {
        if output.finished {
            return None;
        }
        if let Some(chunk) = output.reader.next().await {
            return Some((chunk, output));
        }
        output.finished = true;
        match wait_for_exit(&mut output.child, output.stderr.take()).await {
            Ok(()) => None,
            Err(message) => Some((Err(io::Error::other(message)), output)),
        }
    })
    .boxed()
}

async fn wait_for_exit(child: &mut Child, stderr: Option<JoinHandle<String>>) -> Result<(), String> {
    let status = child.wait().await.map_err(|err| err.to_string())?;
    if status.success() {
        return Ok(());
    }
    let stderr = match stderr {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    Err(failure_message(&stderr, &status.to_string()))
}

/// Picks the last meaningful stderr line, which is where yt-dlp puts its
/// `ERROR:` summary.
fn failure_message(stderr: &str, status: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("extractor exited with {status}"))
}

/// Subset of `yt-dlp --dump-single-json`. Every field is optional because
/// yt-dlp omits or nulls them freely.
#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    fulltitle: Option<String>,
    thumbnail: Option<String>,
    thumbnails: Option<Vec<ThumbnailEntry>>,
    duration: Option<f64>,
    formats: Option<Vec<FormatEntry>>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailEntry {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FormatEntry {
    format_id: Option<String>,
    format_note: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<i64>,
    fps: Option<f64>,
    filesize: Option<i64>,
    filesize_approx: Option<i64>,
}

impl InfoJson {
    fn into_details(self) -> VideoDetails {
        let thumbnail = self.thumbnail.filter(|url| !url.is_empty()).or_else(|| {
            self.thumbnails
                .unwrap_or_default()
                .into_iter()
                .find_map(|entry| entry.url.filter(|url| !url.is_empty()))
        });
        let duration_seconds = self
            .duration
            .filter(|value| value.is_finite() && *value > 0.0)
            .map(|value| value as u64)
            .unwrap_or(0);
        let descriptors = self
            .formats
            .unwrap_or_default()
            .into_iter()
            .filter_map(FormatEntry::into_descriptor)
            .collect();

        VideoDetails {
            title: self.title.or(self.fulltitle).unwrap_or_default(),
            thumbnail,
            duration_seconds,
            descriptors,
        }
    }
}

impl FormatEntry {
    fn into_descriptor(self) -> Option<RawStreamDescriptor> {
        let identifier = self.format_id.filter(|id| !id.trim().is_empty())?;
        let has_video_track = has_codec(self.vcodec.as_deref());
        let has_audio_track = has_codec(self.acodec.as_deref());

        let quality_label = if has_video_track {
            format_quality_label(self.height, self.fps).or_else(|| {
                self.format_note
                    .clone()
                    .filter(|note| !note.trim().is_empty())
            })
        } else {
            None
        };
        let audio_quality_tier = if has_audio_track {
            self.format_note.as_deref().and_then(audio_tier_from_note)
        } else {
            None
        };
        let byte_length = self
            .filesize
            .or(self.filesize_approx)
            .and_then(|bytes| u64::try_from(bytes).ok());

        Some(RawStreamDescriptor {
            identifier,
            has_video_track,
            has_audio_track,
            container_format: self.ext.unwrap_or_default(),
            quality_label,
            audio_quality_tier,
            byte_length,
        })
    }
}

fn has_codec(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && !codec.eq_ignore_ascii_case("none"))
}

/// Builds `1080p`, or `1080p60` for high frame rate streams.
fn format_quality_label(height: Option<i64>, fps: Option<f64>) -> Option<String> {
    let height = height.filter(|h| *h > 0)?;
    match fps.filter(|rate| rate.is_finite() && *rate > 30.0) {
        Some(rate) => Some(format!("{height}p{}", rate.round() as i64)),
        None => Some(format!("{height}p")),
    }
}

/// yt-dlp reports the platform's audio bucket as a word inside `format_note`
/// (`"medium"`, `"English (default), low"`).
fn audio_tier_from_note(note: &str) -> Option<AudioQualityTier> {
    note.split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(|word| match word.to_ascii_lowercase().as_str() {
            "high" => Some(AudioQualityTier::High),
            "medium" => Some(AudioQualityTier::Medium),
            "low" => Some(AudioQualityTier::Low),
            "ultralow" => Some(AudioQualityTier::UltraLow),
            _ => None,
        })
}
