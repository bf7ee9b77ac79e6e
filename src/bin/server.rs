#![forbid(unsafe_code)]

//! HTTP front of grabtube.
//!
//! A request names a video URL and an output format; the configured
//! extractors fetch it into the downloads directory and the result is recorded
//! in the caller's history, which the retention sweeper later expires. The
//! frontend itself is served as static files from the www root.
//!
//! Identity comes from the `x-user-id` header only when
//! `GRABTUBE_TRUST_USER_HEADER` (or `--trust-user-header`) is set, and that
//! must only be done behind an auth proxy that sets or strips the header.
//! Otherwise every caller shares the anonymous history.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use clap::Parser;
use grabtube::{
    config::{DataPaths, RuntimeOverrides, resolve_runtime_settings},
    extract::{DownloadRequest, ExtractionChain, ExtractionError},
    history::{
        ANONYMOUS_USER, CompletedDownload, HistoryEntry, HistoryStore, MediaFormat,
        RetentionPolicy,
    },
    security::{ensure_not_root, is_safe_path_segment, sanitize_title, validate_video_url},
    storage::{JsonDirStorage, remove_backing_file},
    sweeper::{RetentionSweeper, purge_orphans},
    telemetry::init_tracing,
};
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{error, info, warn};

/// Header carrying the caller's identity, set by the auth proxy in front of
/// the server.
const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Parser)]
#[command(name = "grabtube-server", about = "Video download API with expiring history")]
struct ServerArgs {
    /// Root holding downloads/, history/ and cookies.txt.
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Directory with the static frontend.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<IpAddr>,
    /// Alternate dotenv file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Key histories by the x-user-id header set by an auth proxy.
    #[arg(long)]
    trust_user_header: bool,
}

impl ServerArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_root: self.data_root.clone(),
            www_root: self.www_root.clone(),
            port: self.port,
            host: self.host.map(|host| host.to_string()),
            env_path: self.env_file.clone(),
            trust_user_header: self.trust_user_header.then_some(true),
        }
    }
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    history: Arc<HistoryStore>,
    extractors: Arc<ExtractionChain>,
    paths: Arc<DataPaths>,
    www_root: Arc<PathBuf>,
    trust_user_header: bool,
}

impl AppState {
    fn user(&self, headers: &HeaderMap) -> String {
        if self.trust_user_header {
            user_key(headers)
        } else {
            ANONYMOUS_USER.to_string()
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    requires_auth: bool,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            requires_auth: false,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn requires_auth() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "This video is restricted. Please sign in to continue.".into(),
            requires_auth: true,
        }
    }
}

impl From<ExtractionError> for ApiError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::RequiresAuth(_) => Self::requires_auth(),
            ExtractionError::Unsupported(_) => {
                Self::bad_request("This URL is not supported by any extractor.")
            }
            ExtractionError::Failed(_) | ExtractionError::Join(_) => {
                error!(error = %err, "extraction failed");
                Self::internal("Could not fetch the video. Check the URL and try again.")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.message });
        if self.requires_auth {
            body["requiresAuth"] = serde_json::Value::Bool(true);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = ServerArgs::parse();
    ensure_not_root("grabtube-server")?;

    let settings = resolve_runtime_settings(args.overrides())?;
    let host: IpAddr = settings
        .host
        .parse()
        .context("expected a valid IPv4 or IPv6 address for --host/GRABTUBE_HOST")?;
    let paths = settings.paths();
    paths.create_dirs()?;

    let storage = JsonDirStorage::open(&paths.history)
        .with_context(|| format!("opening {}", paths.history.display()))?;
    let retention = chrono::Duration::from_std(settings.retention)
        .context("retention window out of range")?;
    let history = Arc::new(HistoryStore::new(
        Arc::new(storage),
        RetentionPolicy {
            max_entries: settings.max_history,
            retention,
        },
    ));

    let policy = history.policy();
    info!(
        max_entries = policy.max_entries,
        retention_secs = policy.retention.num_seconds(),
        "history retention configured"
    );

    let referenced = history.referenced_files().await?;
    purge_orphans(&paths.downloads, &referenced, settings.retention);

    let shutdown = CancellationToken::new();
    let sweeper = RetentionSweeper::new(history.clone(), settings.sweep_interval)
        .spawn(shutdown.clone());

    let state = AppState {
        history,
        extractors: Arc::new(ExtractionChain::from_programs(
            &settings.extractors,
            &paths.cookies,
        )),
        paths: Arc::new(paths),
        www_root: Arc::new(settings.www_root.clone()),
        trust_user_header: settings.trust_user_header,
    };
    if state.trust_user_header {
        info!(header = USER_HEADER, "keying histories by the auth proxy's user header");
    } else {
        warn!("user header not trusted; all callers share the anonymous history");
    }
    let app = router(state);

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, extractors = ?settings.extractors, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "retention sweeper ended abnormally");
    }
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/video-info", get(video_info))
        .route("/api/downloads", post(start_download))
        .route("/api/history", get(get_history).delete(clear_history))
        .route("/api/history/clear", post(clear_history))
        .route("/api/files/{name}", get(download_file))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

fn user_key(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// Sanitized title plus a short digest so two downloads of the same video
/// never share a file.
fn unique_stem(title: &str, user: &str, url: &str, at: DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(user.as_bytes());
    hasher.update(b"\0");
    hasher.update(url.as_bytes());
    hasher.update(b"\0");
    hasher.update(&at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = hasher.finalize().to_hex();
    format!("{}-{}", sanitize_title(title), &digest[..8])
}

/// Percent-encodes a file name for use as a single URL path segment.
fn encode_segment(name: &str) -> String {
    url::form_urlencoded::byte_serialize(name.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[derive(Deserialize)]
struct VideoInfoQuery {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoInfoResponse {
    title: String,
    thumbnail: Option<String>,
}

async fn video_info(
    State(state): State<AppState>,
    Query(query): Query<VideoInfoQuery>,
) -> ApiResult<Json<VideoInfoResponse>> {
    let raw = query
        .url
        .ok_or_else(|| ApiError::bad_request("No URL provided."))?;
    let url = validate_video_url(&raw).map_err(|err| ApiError::bad_request(err.to_string()))?;

    let extractors = state.extractors.clone();
    let info = tokio::task::spawn_blocking(move || extractors.probe(url.as_str()))
        .await
        .map_err(ExtractionError::from)??;
    Ok(Json(VideoInfoResponse {
        title: info.title,
        thumbnail: info.thumbnail,
    }))
}

#[derive(Deserialize)]
struct DownloadBody {
    url: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    file_name: String,
    title: String,
    format: MediaFormat,
    download_url: String,
    expires_at: DateTime<Utc>,
}

async fn start_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DownloadBody>,
) -> ApiResult<Json<DownloadResponse>> {
    let user = state.user(&headers);
    let (Some(raw_url), Some(raw_format)) = (payload.url, payload.format) else {
        return Err(ApiError::bad_request("URL or format not provided."));
    };
    let url = validate_video_url(&raw_url).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let format: MediaFormat = raw_format.parse().map_err(ApiError::bad_request)?;
    info!(user = %user, %format, audio = format.is_audio(), url = %url, "starting download");

    let extractors = state.extractors.clone();
    let output_dir = state.paths.downloads.clone();
    let job_user = user.clone();
    let job_url = url.to_string();
    let (title, file_path) = tokio::task::spawn_blocking(move || {
        let info = extractors.probe(&job_url)?;
        let stem = unique_stem(&info.title, &job_user, &job_url, Utc::now());
        let path = extractors.download(&DownloadRequest {
            url: job_url,
            format,
            output_dir,
            stem,
        })?;
        Ok::<_, ExtractionError>((info.title, path))
    })
    .await
    .map_err(ExtractionError::from)??;

    let filename = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ApiError::internal("extractor produced an unnamed file"))?;

    let recorded = state
        .history
        .record_download(
            &user,
            CompletedDownload {
                filename: filename.clone(),
                title,
                format,
                url: url.to_string(),
                file_path: file_path.clone(),
                completed_at: Utc::now(),
            },
        )
        .await;
    let entry = match recorded {
        Ok(entry) => entry,
        Err(err) => {
            error!(user = %user, error = %err, "recording download failed; discarding file");
            remove_backing_file(&file_path);
            return Err(ApiError::internal("Could not save the download."));
        }
    };

    Ok(Json(DownloadResponse {
        download_url: format!("/api/files/{}", encode_segment(&entry.filename)),
        file_name: entry.filename,
        title: entry.title,
        format: entry.format,
        expires_at: entry.expires_at,
    }))
}

async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    let user = state.user(&headers);
    let entries = state
        .history
        .get_history(&user)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(entries))
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    message: &'static str,
    removed: usize,
}

async fn clear_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ClearResponse>> {
    let user = state.user(&headers);
    let removed = state
        .history
        .clear_history(&user)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(ClearResponse {
        message: "History cleared.",
        removed,
    }))
}

/// Streams a file from the caller's own history. Anything else, including
/// files that belong to other users, is a 404.
async fn download_file(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_safe_path_segment(&name) {
        return Err(ApiError::not_found("file not found"));
    }
    let user = state.user(&headers);
    let entry = state
        .history
        .find_entry(&user, &name)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("file not found"))?;

    let mut response = stream_file(entry.file_path, None, Some(&headers)).await?;
    let disposition = format!("attachment; filename*=UTF-8''{}", encode_segment(&entry.filename));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html"), None, None).await,
        Ok(_) => stream_file(target, None, None).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html"), None, None).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Extensionless paths are client-side routes of the frontend.
fn should_fallback_to_index(request_path: &str) -> bool {
    Path::new(request_path.trim_start_matches('/'))
        .extension()
        .is_none()
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{size}")) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = guessed.and_then(|mime| HeaderValue::from_str(mime.as_ref()).ok()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

/// Parses a single `bytes=` range, including the `-N` suffix form.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let (unit, range) = value.to_str().ok()?.trim().split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let (start_str, end_str) = range.trim().split_once('-')?;

    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    (end >= start).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use grabtube::extract::{ExtractionOutcome, ExtractionStrategy, VideoInfo};
    use serde_json::Value;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    /// Writes a small file in place of a real extractor.
    struct FakeExtractor {
        restricted: bool,
    }

    impl ExtractionStrategy for FakeExtractor {
        fn name(&self) -> &str {
            "fake"
        }

        fn probe(&self, url: &str) -> ExtractionOutcome<VideoInfo> {
            if self.restricted {
                return ExtractionOutcome::RequiresAuth("Sign in to confirm your age".into());
            }
            ExtractionOutcome::Completed(VideoInfo {
                title: format!("Clip: {}", url.rsplit('=').next().unwrap_or("x")),
                thumbnail: Some("https://i.example/t.jpg".into()),
            })
        }

        fn download(&self, request: &DownloadRequest) -> ExtractionOutcome<PathBuf> {
            let ext = match request.format {
                MediaFormat::Best => "mkv",
                other => other.as_str(),
            };
            let path = request.output_dir.join(format!("{}.{ext}", request.stem));
            match fs::write(&path, b"0123456789") {
                Ok(()) => ExtractionOutcome::Completed(path),
                Err(err) => ExtractionOutcome::Transient(err.to_string()),
            }
        }
    }

    struct ServerTestContext {
        _temp: TempDir,
        state: AppState,
    }

    impl ServerTestContext {
        fn new(max_entries: usize) -> Self {
            Self::with_extractor(max_entries, FakeExtractor { restricted: false })
        }

        fn with_extractor(max_entries: usize, extractor: FakeExtractor) -> Self {
            let temp = tempdir().unwrap();
            let paths = DataPaths::new(&temp.path().join("data"));
            paths.create_dirs().unwrap();
            let www = temp.path().join("www");
            fs::create_dir_all(&www).unwrap();
            fs::write(www.join("index.html"), "<html>grabtube</html>").unwrap();

            let storage = JsonDirStorage::open(&paths.history).unwrap();
            let history = HistoryStore::new(
                Arc::new(storage),
                RetentionPolicy {
                    max_entries,
                    retention: chrono::Duration::hours(1),
                },
            );
            let state = AppState {
                history: Arc::new(history),
                extractors: Arc::new(ExtractionChain::new(vec![Box::new(extractor)])),
                paths: Arc::new(paths),
                www_root: Arc::new(www),
                trust_user_header: true,
            };
            Self { _temp: temp, state }
        }

        async fn download(&self, user: &str, video: &str, format: &str) -> DownloadResponse {
            let Json(response) = start_download(
                State(self.state.clone()),
                user_headers(user),
                Json(DownloadBody {
                    url: Some(format!("https://www.youtube.com/watch?v={video}")),
                    format: Some(format.into()),
                }),
            )
            .await
            .unwrap();
            response
        }
    }

    fn user_headers(user: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_str(user).unwrap());
        headers
    }

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn server_args_map_to_overrides() {
        let args = ServerArgs::try_parse_from([
            "grabtube-server",
            "--data-root",
            "/srv/grab",
            "--port",
            "4242",
            "--host",
            "0.0.0.0",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.data_root, Some(PathBuf::from("/srv/grab")));
        assert_eq!(overrides.port, Some(4242));
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert!(overrides.www_root.is_none());
    }

    #[test]
    fn server_args_reject_bad_host() {
        assert!(ServerArgs::try_parse_from(["grabtube-server", "--host", "nope"]).is_err());
    }

    #[test]
    fn user_key_defaults_to_anonymous() {
        assert_eq!(user_key(&HeaderMap::new()), ANONYMOUS_USER);
        assert_eq!(user_key(&user_headers("  ")), ANONYMOUS_USER);
        assert_eq!(user_key(&user_headers("alice")), "alice");
    }

    #[test]
    fn trust_user_header_flag_maps_to_override() {
        let args = ServerArgs::try_parse_from(["grabtube-server", "--trust-user-header"]).unwrap();
        assert_eq!(args.overrides().trust_user_header, Some(true));
        let args = ServerArgs::try_parse_from(["grabtube-server"]).unwrap();
        assert_eq!(args.overrides().trust_user_header, None);
    }

    #[test]
    fn unique_stem_differs_per_download() {
        let at = Utc::now();
        let first = unique_stem("My: Video?", "u", "https://x/v", at);
        let again = unique_stem("My: Video?", "u", "https://x/v", at);
        let later = unique_stem("My: Video?", "u", "https://x/v", at + chrono::Duration::nanoseconds(1));
        assert!(first.starts_with("My Video-"));
        assert_eq!(first.len(), "My Video-".len() + 8);
        assert_eq!(first, again);
        assert_ne!(first, later);
    }

    #[test]
    fn encode_segment_escapes_spaces_and_reserved() {
        assert_eq!(encode_segment("a b+c#.mp4"), "a%20b%2Bc%23.mp4");
    }

    #[test]
    fn range_header_forms() {
        let parse = |raw: &str| parse_range_header(&HeaderValue::from_str(raw).unwrap(), 100);
        assert_eq!(parse("bytes=0-9"), Some((0, 9)));
        assert_eq!(parse("bytes=90-"), Some((90, 99)));
        assert_eq!(parse("bytes=-10"), Some((90, 99)));
        assert_eq!(parse("bytes=-500"), Some((0, 99)));
        assert_eq!(parse("bytes=9-0"), None);
        assert_eq!(parse("items=0-1"), None);
    }

    #[tokio::test]
    async fn download_records_history_and_serves_file() {
        let ctx = ServerTestContext::new(20);
        let response = ctx.download("alice", "abc", "mp3").await;
        assert!(response.file_name.starts_with("Clip abc-"));
        assert!(response.file_name.ends_with(".mp3"));
        assert_eq!(response.format, MediaFormat::Mp3);
        assert!(response.download_url.starts_with("/api/files/Clip%20abc-"));

        let Json(history) = get_history(State(ctx.state.clone()), user_headers("alice"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].filename, response.file_name);
        assert_eq!(history[0].url, "https://www.youtube.com/watch?v=abc");

        let file = download_file(
            State(ctx.state.clone()),
            AxumPath(response.file_name.clone()),
            user_headers("alice"),
        )
        .await
        .unwrap();
        assert_eq!(file.status(), StatusCode::OK);
        assert_eq!(file.headers().get(header::CONTENT_TYPE).unwrap(), "audio/mpeg");
        assert!(
            file.headers()
                .get(header::CONTENT_DISPOSITION)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("attachment;")
        );
        let body = to_bytes(file.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn files_are_private_to_their_owner() {
        let ctx = ServerTestContext::new(20);
        let response = ctx.download("alice", "abc", "mp4").await;

        let err = download_file(
            State(ctx.state.clone()),
            AxumPath(response.file_name),
            user_headers("mallory"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let Json(history) = get_history(State(ctx.state.clone()), user_headers("mallory"))
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn download_file_rejects_traversal() {
        let ctx = ServerTestContext::new(20);
        let err = download_file(
            State(ctx.state.clone()),
            AxumPath("../history".into()),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn range_requests_return_partial_content() {
        let ctx = ServerTestContext::new(20);
        let response = ctx.download(ANONYMOUS_USER, "abc", "webm").await;
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));

        let file = download_file(State(ctx.state.clone()), AxumPath(response.file_name), headers)
            .await
            .unwrap();
        assert_eq!(file.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(file.headers().get(header::CONTENT_RANGE).unwrap(), "bytes 2-5/10");
        let body = to_bytes(file.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"2345");
    }

    #[tokio::test]
    async fn history_bound_evicts_oldest_file() {
        let ctx = ServerTestContext::new(2);
        let a = ctx.download("u", "a", "mp4").await;
        let _b = ctx.download("u", "b", "mp3").await;
        let _c = ctx.download("u", "c", "mp4").await;

        let Json(history) = get_history(State(ctx.state.clone()), user_headers("u"))
            .await
            .unwrap();
        let titles: Vec<_> = history.iter().map(|entry| entry.title.as_str()).collect();
        assert_eq!(titles, ["Clip: c", "Clip: b"]);
        assert!(!ctx.state.paths.downloads.join(&a.file_name).exists());
    }

    #[tokio::test]
    async fn clear_history_deletes_files() {
        let ctx = ServerTestContext::new(20);
        let a = ctx.download("u", "a", "mp4").await;
        let b = ctx.download("u", "b", "opus").await;

        let Json(cleared) = clear_history(State(ctx.state.clone()), user_headers("u"))
            .await
            .unwrap();
        assert_eq!(cleared.removed, 2);
        assert!(!ctx.state.paths.downloads.join(&a.file_name).exists());
        assert!(!ctx.state.paths.downloads.join(&b.file_name).exists());

        let Json(again) = clear_history(State(ctx.state.clone()), user_headers("u"))
            .await
            .unwrap();
        assert_eq!(again.removed, 0);
    }

    #[tokio::test]
    async fn download_validates_input() {
        let ctx = ServerTestContext::new(20);
        let missing = start_download(
            State(ctx.state.clone()),
            HeaderMap::new(),
            Json(DownloadBody {
                url: None,
                format: Some("mp4".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);

        let bad_format = start_download(
            State(ctx.state.clone()),
            HeaderMap::new(),
            Json(DownloadBody {
                url: Some("https://www.youtube.com/watch?v=abc".into()),
                format: Some("flac".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(bad_format.status, StatusCode::BAD_REQUEST);

        let bad_url = start_download(
            State(ctx.state.clone()),
            HeaderMap::new(),
            Json(DownloadBody {
                url: Some("javascript:alert(1)".into()),
                format: Some("mp4".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(bad_url.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn restricted_videos_ask_for_sign_in() {
        let ctx = ServerTestContext::with_extractor(20, FakeExtractor { restricted: true });
        let err = start_download(
            State(ctx.state.clone()),
            HeaderMap::new(),
            Json(DownloadBody {
                url: Some("https://www.youtube.com/watch?v=abc".into()),
                format: Some("mp4".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let body = body_json(err.into_response()).await;
        assert_eq!(body["requiresAuth"], true);
        assert!(
            fs::read_dir(&ctx.state.paths.downloads)
                .unwrap()
                .next()
                .is_none()
        );
    }

    #[tokio::test]
    async fn video_info_returns_title_and_thumbnail() {
        let ctx = ServerTestContext::new(20);
        let Json(info) = video_info(
            State(ctx.state.clone()),
            Query(VideoInfoQuery {
                url: Some("https://www.youtube.com/watch?v=xyz".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(info.title, "Clip: xyz");
        assert_eq!(info.thumbnail.as_deref(), Some("https://i.example/t.jpg"));

        let err = video_info(State(ctx.state.clone()), Query(VideoInfoQuery { url: None }))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn static_fallback_serves_index_and_hides_api() {
        let ctx = ServerTestContext::new(20);
        let index = static_fallback(
            State(ctx.state.clone()),
            Request::builder().uri("/profile").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(index.status(), StatusCode::OK);

        let api = static_fallback(
            State(ctx.state.clone()),
            Request::builder().uri("/api/unknown").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(api.status(), StatusCode::NOT_FOUND);

        let missing_asset = static_fallback(
            State(ctx.state.clone()),
            Request::builder().uri("/missing.css").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(missing_asset.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn untrusted_header_maps_everyone_to_anonymous() {
        let mut ctx = ServerTestContext::new(20);
        ctx.state.trust_user_header = false;
        let response = ctx.download("alice", "abc", "mp4").await;

        let Json(anonymous) = get_history(State(ctx.state.clone()), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(anonymous.len(), 1);
        assert_eq!(anonymous[0].filename, response.file_name);

        let Json(spoofed) = get_history(State(ctx.state.clone()), user_headers("bob"))
            .await
            .unwrap();
        assert_eq!(spoofed, anonymous);
    }

    #[test]
    fn unique_stem_fits_a_file_name_for_long_multibyte_titles() {
        let stem = unique_stem(&"日本語の動画タイトル".repeat(20), "u", "https://x/v", Utc::now());
        assert!(format!("{stem}.webm.part").len() <= 255);
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let body = body_json(ApiError::not_found("missing").into_response()).await;
        assert_eq!(body["error"], "missing");
        assert!(body.get("requiresAuth").is_none());
    }
}
