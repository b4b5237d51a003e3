#![forbid(unsafe_code)]

//! Axum routes that put the extractor and the format ladders behind a small
//! JSON contract for the web client.
//!
//! Handlers stay thin: validate the query, call into `AppState`, and map any
//! failure onto `ApiError`, which always renders as `{"error", "kind"}`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    extractor::{Extractor, ExtractorError, MediaStream},
    formats::{self, FormatOptions},
    video_url,
};

/// Error surface of every endpoint. The message is what the client shows; the
/// kind is stable and meant for programmatic checks.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Upstream(_) => "upstream_error",
            Self::NotFound(_) => "not_found",
        }
    }
}

impl From<ExtractorError> for ApiError {
    fn from(err: ExtractorError) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidInput(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Upstream(message) = &self {
            tracing::error!(error = %message, "extractor failure");
        }
        let body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Response of `/video-info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration: String,
    pub embed_url: String,
    pub formats: FormatOptions,
}

/// Container the client asked for. Only names the saved file; nothing is
/// transcoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadFormat {
    Mp4,
    Mp3,
}

impl DownloadFormat {
    fn parse(value: Option<&str>) -> ApiResult<Self> {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("mp4") => Ok(Self::Mp4),
            Some("mp3") => Ok(Self::Mp3),
            Some(other) => Err(ApiError::InvalidInput(format!(
                "Unsupported format: {other}"
            ))),
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => formats::VIDEO_CONTAINER,
            Self::Mp3 => formats::AUDIO_CONTAINER,
        }
    }
}

/// Shared state injected into every handler. Nothing in here is mutated
/// after startup.
#[derive(Clone)]
pub struct AppState {
    extractor: Arc<dyn Extractor>,
}

impl AppState {
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }

    /// Validates the URL, asks the extractor for metadata and reduces the
    /// stream list to the user-facing ladders.
    pub async fn fetch_summary(&self, raw_url: Option<&str>) -> ApiResult<VideoSummary> {
        let video_id = resolve_video_id(raw_url)?;
        let details = self
            .extractor
            .fetch_details(&video_url::watch_url(&video_id))
            .await?;

        let formats = formats::normalize(&details.descriptors);
        tracing::debug!(
            video_id = %video_id,
            streams = details.descriptors.len(),
            video_options = formats.video.len(),
            audio_options = formats.audio.len(),
            "normalized formats"
        );
        if formats.is_empty() {
            tracing::warn!(video_id = %video_id, "no stream matched the quality ladders");
        }

        Ok(VideoSummary {
            title: details.title,
            thumbnail: details.thumbnail,
            duration: formats::format_duration(details.duration_seconds),
            embed_url: video_url::embed_url(&video_id),
            formats,
        })
    }

    /// Re-resolves the video and opens the stream behind `identifier`. Stream
    /// identifiers can go stale between the summary and the download, so the
    /// identifier is checked against a fresh listing first.
    pub async fn open_download(
        &self,
        raw_url: Option<&str>,
        identifier: Option<&str>,
    ) -> ApiResult<MediaStream> {
        let video_id = resolve_video_id(raw_url)?;
        let identifier = identifier
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::InvalidInput("Format identifier is required".into()))?;

        let watch_url = video_url::watch_url(&video_id);
        let details = self.extractor.fetch_details(&watch_url).await?;
        if !details
            .descriptors
            .iter()
            .any(|descriptor| descriptor.identifier == identifier)
        {
            return Err(ApiError::Upstream(format!(
                "No such format found: {identifier}"
            )));
        }

        Ok(self.extractor.open_stream(&watch_url, identifier).await?)
    }
}

fn resolve_video_id(raw_url: Option<&str>) -> ApiResult<String> {
    let url = raw_url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::InvalidInput("URL is required".into()))?;
    video_url::video_id(url).ok_or_else(|| ApiError::InvalidInput("Invalid YouTube URL".into()))
}

/// Builds the application router with request tracing and the CORS policy
/// restricted to a single origin.
pub fn router(state: AppState, allowed_origin: &str) -> Result<Router> {
    let origin = HeaderValue::from_str(allowed_origin)
        .with_context(|| format!("invalid allowed origin {allowed_origin:?}"))?;
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list([origin]))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([header::CONTENT_DISPOSITION])
        .allow_credentials(true);

    Ok(Router::new()
        .route("/ping", get(ping))
        .route("/video-info", get(video_info))
        .route("/download", get(download))
        .fallback(not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .layer(cors)
        .with_state(state))
}

#[derive(Debug, Deserialize)]
struct VideoInfoQuery {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    #[serde(alias = "identifier")]
    itag: Option<String>,
    format: Option<String>,
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn video_info(
    State(state): State<AppState>,
    query: Result<Query<VideoInfoQuery>, QueryRejection>,
) -> ApiResult<Json<VideoSummary>> {
    let Query(query) = query?;
    tracing::info!(url = query.url.as_deref().unwrap_or(""), "video info requested");
    let summary = state.fetch_summary(query.url.as_deref()).await?;
    Ok(Json(summary))
}

async fn download(
    State(state): State<AppState>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let format = DownloadFormat::parse(query.format.as_deref())?;
    tracing::info!(
        url = query.url.as_deref().unwrap_or(""),
        identifier = query.itag.as_deref().unwrap_or(""),
        container = format.extension(),
        "download requested"
    );
    let stream = state
        .open_download(query.url.as_deref(), query.itag.as_deref())
        .await?;

    let filename = format!("video.{}", format.extension());
    let mime = MimeGuess::from_path(&filename).first_or_octet_stream();
    axum::http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|err| ApiError::Upstream(err.to_string()))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("endpoint not found".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        extractor::VideoDetails,
        formats::{AudioQualityTier, RawStreamDescriptor},
    };
    use async_trait::async_trait;
    use axum::body::{Bytes, to_bytes};
    use futures_util::{StreamExt, stream};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const ORIGIN: &str = "http://localhost:5173";
    const WATCH: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    /// Canned extractor that records how often it was consulted.
    struct FakeExtractor {
        details: Result<VideoDetails, String>,
        payload: &'static [u8],
        calls: AtomicUsize,
        requested: std::sync::Mutex<Vec<String>>,
    }

    impl FakeExtractor {
        fn with_details(details: VideoDetails) -> Arc<Self> {
            Arc::new(Self {
                details: Ok(details),
                payload: b"media-bytes",
                calls: AtomicUsize::new(0),
                requested: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                details: Err(message.to_string()),
                payload: b"",
                calls: AtomicUsize::new(0),
                requested: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn fetch_details(&self, video_url: &str) -> Result<VideoDetails, ExtractorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(video_url.to_string());
            self.details.clone().map_err(ExtractorError::Failed)
        }

        async fn open_stream(
            &self,
            _video_url: &str,
            _identifier: &str,
        ) -> Result<MediaStream, ExtractorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(stream::iter(vec![Ok(Bytes::from_static(self.payload))]).boxed())
        }
    }

    fn descriptor(id: &str, label: Option<&str>, container: &str) -> RawStreamDescriptor {
        RawStreamDescriptor {
            identifier: id.into(),
            has_video_track: label.is_some(),
            has_audio_track: label.is_none(),
            container_format: container.into(),
            quality_label: label.map(str::to_string),
            audio_quality_tier: None,
            byte_length: None,
        }
    }

    fn sample_details() -> VideoDetails {
        let mut high = descriptor("251", None, "webm");
        high.audio_quality_tier = Some(AudioQualityTier::High);
        high.byte_length = Some(15_728_640);
        VideoDetails {
            title: "Sample".into(),
            thumbnail: Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/default.jpg".into()),
            duration_seconds: 65,
            descriptors: vec![
                descriptor("sb0", None, "mhtml"),
                descriptor("A", Some("1080p60"), "mp4"),
                descriptor("B", Some("720p"), "mp4"),
                high,
            ],
        }
    }

    fn app(extractor: Arc<FakeExtractor>) -> Router {
        router(AppState::new(extractor), ORIGIN).unwrap()
    }

    async fn send_get(app: Router, uri: &str) -> Response {
        app.oneshot(
            axum::http::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn encoded(url: &str) -> String {
        url::form_urlencoded::byte_serialize(url.as_bytes()).collect()
    }

    #[tokio::test]
    async fn ping_reports_ok() {
        let response = send_get(app(FakeExtractor::with_details(sample_details())), "/ping").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn summary_shapes_formats_and_metadata() {
        let fake = FakeExtractor::with_details(sample_details());
        let uri = format!("/video-info?url={}", encoded(WATCH));
        let response = send_get(app(fake.clone()), &uri).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["title"], "Sample");
        assert_eq!(body["duration"], "1:05");
        assert_eq!(
            body["embedUrl"],
            "https://www.youtube.com/embed/dQw4w9WgXcQ"
        );
        assert_eq!(
            body["formats"]["video"],
            json!([
                {"itag": "A", "quality": "1080p", "container": "mp4", "size": "Unknown size"},
                {"itag": "B", "quality": "720p", "container": "mp4", "size": "Unknown size"},
            ])
        );
        assert_eq!(
            body["formats"]["audio"],
            json!([{"itag": "251", "quality": "High", "container": "mp3", "size": "15.00 MB"}])
        );
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn summary_uses_canonical_watch_url() {
        let fake = FakeExtractor::with_details(sample_details());
        let state = AppState::new(fake.clone());
        state
            .fetch_summary(Some("https://youtu.be/dQw4w9WgXcQ?t=10"))
            .await
            .unwrap();
        assert_eq!(fake.requested.lock().unwrap().as_slice(), [WATCH]);
    }

    #[tokio::test]
    async fn summary_with_no_matching_streams_is_still_ok() {
        let details = VideoDetails {
            descriptors: Vec::new(),
            ..sample_details()
        };
        let state = AppState::new(FakeExtractor::with_details(details));
        let summary = state.fetch_summary(Some(WATCH)).await.unwrap();
        assert!(summary.formats.video.is_empty());
        assert!(summary.formats.audio.is_empty());
        assert_eq!(summary.title, "Sample");
        assert_eq!(summary.duration, "1:05");
        assert!(summary.thumbnail.is_some());
    }

    #[tokio::test]
    async fn missing_url_is_invalid_input() {
        let fake = FakeExtractor::with_details(sample_details());
        let response = send_get(app(fake.clone()), "/video-info").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "URL is required");
        assert_eq!(body["kind"], "invalid_input");
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn undecodable_query_renders_json_error() {
        let fake = FakeExtractor::with_details(sample_details());
        let response = send_get(app(fake.clone()), "/video-info?url=a&url=b").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["kind"], "invalid_input");
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .starts_with("Failed to deserialize query string")
        );

        let response = send_get(app(fake.clone()), "/download?itag=1&itag=2").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "invalid_input");
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn malformed_url_never_reaches_extractor() {
        let fake = FakeExtractor::with_details(sample_details());
        let state = AppState::new(fake.clone());
        let err = state
            .fetch_summary(Some("https://example.com/watch?v=dQw4w9WgXcQ"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Invalid YouTube URL");
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn upstream_message_is_passed_verbatim() {
        let fake = FakeExtractor::failing("ERROR: [youtube] dQw4w9WgXcQ: Video unavailable");
        let uri = format!("/video-info?url={}", encoded(WATCH));
        let response = send_get(app(fake), &uri).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "ERROR: [youtube] dQw4w9WgXcQ: Video unavailable");
        assert_eq!(body["kind"], "upstream_error");
    }

    #[tokio::test]
    async fn download_streams_with_attachment_headers() {
        let fake = FakeExtractor::with_details(sample_details());
        let uri = format!("/download?url={}&itag=251&format=mp3", encoded(WATCH));
        let response = send_get(app(fake.clone()), &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"video.mp3\""
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/mpeg"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"media-bytes");
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn download_accepts_identifier_alias_and_defaults_to_mp4() {
        let fake = FakeExtractor::with_details(sample_details());
        let uri = format!("/download?url={}&identifier=A", encoded(WATCH));
        let response = send_get(app(fake), &uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"video.mp4\""
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
    }

    #[tokio::test]
    async fn download_rejects_stale_identifier() {
        let fake = FakeExtractor::with_details(sample_details());
        let state = AppState::new(fake.clone());
        let err = state
            .open_download(Some(WATCH), Some("999"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::Upstream(_)));
        assert_eq!(err.to_string(), "No such format found: 999");
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn download_validates_inputs_before_extracting() {
        let fake = FakeExtractor::with_details(sample_details());

        let uri = format!("/download?url={}&itag=A&format=flac", encoded(WATCH));
        let response = send_get(app(fake.clone()), &uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Unsupported format: flac");

        let uri = format!("/download?url={}", encoded(WATCH));
        let response = send_get(app(fake.clone()), &uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "Format identifier is required"
        );

        let response = send_get(app(fake.clone()), "/download?itag=A").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_routes_return_json_404() {
        let response = send_get(app(FakeExtractor::with_details(sample_details())), "/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"], "endpoint not found");
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn cors_allows_only_configured_origin() {
        let request = |origin: &str| {
            axum::http::Request::builder()
                .uri("/ping")
                .header(header::ORIGIN, origin)
                .body(Body::empty())
                .unwrap()
        };
        let fake = FakeExtractor::with_details(sample_details());

        let allowed = app(fake.clone()).oneshot(request(ORIGIN)).await.unwrap();
        assert_eq!(
            allowed
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            ORIGIN
        );
        assert_eq!(
            allowed
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
                .unwrap(),
            "true"
        );

        let denied = app(fake)
            .oneshot(request("http://evil.test"))
            .await
            .unwrap();
        assert!(
            denied
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }

    #[test]
    fn invalid_origin_is_rejected() {
        let state = AppState::new(FakeExtractor::with_details(sample_details()));
        assert!(router(state, "bad\norigin").is_err());
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::InvalidInput("missing".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let parsed = json_body(response).await;
        assert_eq!(parsed["error"], "missing");
        assert_eq!(parsed["kind"], "invalid_input");
    }
}
