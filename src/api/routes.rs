use crate::api::token_bucket::TokenBucket;
use crate::app_state::AppState;
use crate::job::RetimeJob;
use axum::body::Body;
use axum::extract::{Extension, Path as AxumPath, Query};
use axum::http::{Request, Response, StatusCode, header};
use axum::response::{IntoResponse, Json};
use bytes::Bytes;
use futures::StreamExt;
use mime_guess::from_path;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::io::Error as IoError;
use std::path::PathBuf;
use tokio::io::AsyncSeekExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

#[derive(Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_id: String,
    pub message: String,
}

#[derive(Serialize, Deserialize)]
pub struct WaitlistResponse {
    pub pending_jobs: usize,
}

/// Validate job ID with basic rules. Dashes and dots are reserved for
/// the published filename (`<id>.<speed>x.mp4`), slashes and spaces
/// would leak into paths.
fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && !job_id.contains('/')
        && !job_id.contains('-')
        && !job_id.contains('.')
        && !job_id.contains(' ')
        && job_id.len() <= 128
}

/// Published filenames are served straight off the videos directory, so
/// anything path-like is rejected before it touches the filesystem.
fn is_valid_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains('/')
        && !filename.contains('\\')
        && !filename.starts_with('.')
        && filename.len() <= 256
}

#[axum::debug_handler]
pub async fn waitlist(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let pending_jobs = state.ledger.pending_count().await;
    (StatusCode::OK, Json(WaitlistResponse { pending_jobs }))
}

/// Accept a raw video body plus retime parameters in the query string
/// (`?id=clip42&speed=2.5`). The file lands in `uploads/` and a job is
/// queued; processing happens in the background.
pub async fn upload_video(
    Extension(state): Extension<AppState>,
    Query(job): Query<RetimeJob>,
    body: Body,
) -> impl IntoResponse {
    let job_id = job.id().to_string();

    if !is_valid_job_id(&job_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(UploadResponse {
                job_id,
                message: "Invalid job ID format".into(),
            }),
        );
    }

    let (min_speed, max_speed) = state.speed_bounds();
    let speed = job.speed.get();
    if !(min_speed..=max_speed).contains(&speed) {
        return (
            StatusCode::BAD_REQUEST,
            Json(UploadResponse {
                job_id,
                message: format!(
                    "Invalid parameters: speed must be in the range {min_speed}-{max_speed}"
                ),
            }),
        );
    }

    if job.crf.is_some_and(|crf| crf > 51) {
        return (
            StatusCode::BAD_REQUEST,
            Json(UploadResponse {
                job_id,
                message: "Invalid parameters: crf can only be set in the range 0-51".into(),
            }),
        );
    }

    if state.ledger.contains(&job_id).await {
        return (
            StatusCode::BAD_REQUEST,
            Json(UploadResponse {
                job_id,
                message: "already in-progress".into(),
            }),
        );
    }

    info!(%job_id, speed, "Uploading file");

    let upload_path = state.uploads_dir().join(&job_id);
    let Ok(mut file) = tokio::fs::File::create(&upload_path).await else {
        error!(%job_id, "Failed to create upload file");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(UploadResponse {
                job_id,
                message: "Failed to create upload file".into(),
            }),
        );
    };

    use tokio::io::AsyncWriteExt as _;
    let mut body_stream = body.into_data_stream();
    while let Some(Ok(chunk)) = body_stream.next().await {
        if file.write_all(&chunk).await.is_err() {
            error!(%job_id, "Failed to write to upload file");
            let _ = tokio::fs::remove_file(&upload_path).await;

            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(UploadResponse {
                    job_id,
                    message: "Failed to write to upload file".into(),
                }),
            );
        }
    }

    if file.flush().await.is_err() {
        error!(%job_id, "Failed to flush upload file");
        let _ = tokio::fs::remove_file(&upload_path).await;
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(UploadResponse {
                job_id,
                message: "Failed to flush upload file".into(),
            }),
        );
    }

    let output = job.output_filename();
    state.ledger.add(&job).await;
    _ = state.job_tx.unbounded_send(job);

    (
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            job_id,
            message: format!("Processing in background, result will be at /videos/{output}"),
        }),
    )
}

fn parse_range(req: &Request<Body>, file_size: u64) -> (StatusCode, u64, u64) {
    if let Some(rh) = req.headers().get(header::RANGE)
        && let Ok(s) = rh.to_str()
        && let Some(stripped) = s.strip_prefix("bytes=")
        && let parts = stripped.split('-').collect::<Vec<_>>()
        && let Ok(start) = parts[0].parse::<u64>()
    {
        let end = parts
            .get(1)
            .and_then(|e| e.parse::<u64>().ok())
            .unwrap_or(file_size - 1)
            .min(file_size - 1);
        // A start past EOF or past the requested end cannot be
        // satisfied; report it instead of underflowing the length math.
        if start > end {
            return (StatusCode::RANGE_NOT_SATISFIABLE, 0, file_size - 1);
        }
        return (StatusCode::PARTIAL_CONTENT, start, end);
    }

    (StatusCode::OK, 0, file_size - 1)
}

async fn try_serve_from_filesystem(
    path: PathBuf,
    start: u64,
    end: u64,
    bucket: TokenBucket,
) -> anyhow::Result<impl futures::Stream<Item = Result<Bytes, IoError>> + Send> {
    let mut fh = tokio::fs::File::open(&path).await?;

    fh.seek(std::io::SeekFrom::Start(start)).await?;
    let len = end - start + 1;

    use tokio::io::AsyncReadExt as _;
    let stream = ReaderStream::new(fh.take(len)).then(move |res| {
        let bucket = bucket.clone();
        async move {
            let chunk = res?;
            bucket.consume(chunk.len()).await;
            Ok::<Bytes, IoError>(chunk)
        }
    });

    Ok(stream)
}

/// Serve a retimed video from the videos directory with HTTP Range
/// support, rate-limited through the shared token bucket.
pub async fn serve_video(
    Extension(state): Extension<AppState>,
    Extension(bucket): Extension<TokenBucket>,
    AxumPath(filename): AxumPath<String>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if !is_valid_filename(&filename) {
        warn!(%filename, "Invalid filename");
        return Ok(err_response(StatusCode::BAD_REQUEST, "Invalid filename"));
    }

    let local_path = state.videos_dir().join(&filename);
    debug!(%filename, ?local_path, "Request to serve file");

    let Ok(metadata) = tokio::fs::metadata(&local_path).await else {
        return Ok(file_not_found());
    };
    let size = metadata.len();
    if size == 0 {
        return Ok(Response::new(Body::empty()));
    }

    let (status, start, end) = parse_range(&req, size);
    if status == StatusCode::RANGE_NOT_SATISFIABLE {
        warn!(%filename, size, "Unsatisfiable range request");
        let mut res = Response::new(Body::empty());
        *res.status_mut() = status;
        res.headers_mut().insert(
            header::CONTENT_RANGE,
            format!("bytes */{size}").parse().unwrap(),
        );
        return Ok(res);
    }
    let len = end - start + 1;

    let maybe_res = try_serve_from_filesystem(local_path.clone(), start, end, bucket.clone())
        .await
        .map(|stream| {
            debug!(%filename, "Serving video from filesystem");
            Response::new(Body::from_stream(stream))
        })
        .inspect_err(|error| {
            error!(%filename, ?error, "Failed to serve video from filesystem");
        });

    let Ok(mut res) = maybe_res else {
        return Ok(file_not_found());
    };
    *res.status_mut() = status;
    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        from_path(&filename)
            .first_or_octet_stream()
            .to_string()
            .parse()
            .unwrap(),
    );
    headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    headers.insert(
        header::CACHE_CONTROL,
        "public,max-age=3600".parse().unwrap(),
    );
    headers.insert(header::CONTENT_LENGTH, len.to_string().parse().unwrap());
    if status == StatusCode::PARTIAL_CONTENT {
        headers.insert(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{size}").parse().unwrap(),
        );
    }
    Ok(res)
}

fn file_not_found() -> Response<Body> {
    err_response(StatusCode::NOT_FOUND, "File not found")
}

pub(crate) fn err_response(status: StatusCode, body_str: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body_str))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_job_id() {
        assert!(is_valid_job_id("test123"));
        assert!(is_valid_job_id("clip"));
        assert!(is_valid_job_id("ABC123def"));

        // Invalid cases
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id("test/job"));
        assert!(!is_valid_job_id("test-job"));
        assert!(!is_valid_job_id("test.job"));
        assert!(!is_valid_job_id("test job"));
        assert!(!is_valid_job_id(&"a".repeat(129))); // too long
    }

    #[test]
    fn test_is_valid_filename() {
        assert!(is_valid_filename("clip42.2x.mp4"));
        assert!(is_valid_filename("clip42.0.25x.mp4"));

        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename("../secret"));
        assert!(!is_valid_filename("a/b.mp4"));
        assert!(!is_valid_filename("a\\b.mp4"));
        assert!(!is_valid_filename(&"a".repeat(257)));
    }

    #[test]
    fn test_parse_range() {
        let full = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(parse_range(&full, 100), (StatusCode::OK, 0, 99));

        let bounded = Request::builder()
            .header(header::RANGE, "bytes=10-19")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            parse_range(&bounded, 100),
            (StatusCode::PARTIAL_CONTENT, 10, 19)
        );

        let open_ended = Request::builder()
            .header(header::RANGE, "bytes=90-")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            parse_range(&open_ended, 100),
            (StatusCode::PARTIAL_CONTENT, 90, 99)
        );

        let over_long = Request::builder()
            .header(header::RANGE, "bytes=10-5000")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            parse_range(&over_long, 100),
            (StatusCode::PARTIAL_CONTENT, 10, 99)
        );
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        // Start past EOF must not underflow into a bogus length.
        let past_eof = Request::builder()
            .header(header::RANGE, "bytes=500-")
            .body(Body::empty())
            .unwrap();
        let (status, start, end) = parse_range(&past_eof, 100);
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(end >= start);

        let inverted = Request::builder()
            .header(header::RANGE, "bytes=10-5")
            .body(Body::empty())
            .unwrap();
        let (status, start, end) = parse_range(&inverted, 100);
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(end >= start);
    }
}
