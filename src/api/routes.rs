use crate::AppState;
use crate::error::RelayError;
use crate::workspace::ScopedDir;
use axum::body::Body;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Extension, Multipart};
use axum::http::{HeaderValue, Response, header};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const VIDEO_FIELD: &str = "video";
pub const VIDEO_MP4: &str = "video/mp4";
const CONTENT_DISPOSITION: &str = "inline; filename=video.mp4";

/// `POST /video`: run the external processor on the uploaded MP4 and relay
/// the file it produces.
pub(crate) async fn analyze_video(
    Extension(state): Extension<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response<Body>, RelayError> {
    let request_id = Uuid::new_v4();

    let multipart = multipart.map_err(|rejection| {
        warn!(%request_id, reason = %rejection.body_text(), "Not a multipart upload");
        RelayError::Multipart(rejection.body_text())
    })?;

    let video = extract_video(multipart)
        .await
        .inspect_err(|error| warn!(%request_id, %error, "Upload rejected"))?;
    info!(%request_id, size = video.len(), "Video buffered");

    let _permit = state
        .permits
        .acquire()
        .await
        .map_err(|_| RelayError::PermitsClosed)?;
    debug!(%request_id, "Processor permit acquired");

    let scope = ScopedDir::create(state.jobs_dir(), request_id).map_err(|error| {
        warn!(%request_id, %error, "Failed to create scoped output dir");
        RelayError::Workspace(error)
    })?;
    let result = process_and_read(&state, video, &scope).await;
    scope.release();

    let data = result?;
    info!(%request_id, size = data.len(), "Relaying processed video");
    Ok(video_response(data))
}

/// Find the `video` field and buffer it. The declared content type is
/// checked before any of the payload is read.
pub(crate) async fn extract_video(mut multipart: Multipart) -> Result<Bytes, RelayError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| RelayError::Multipart(error.body_text()))?
    {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }

        // raw header bytes, the parsed mime is case-normalized
        let content_type = field.headers().get(header::CONTENT_TYPE);
        if content_type.map(|v| v.as_bytes()) != Some(VIDEO_MP4.as_bytes()) {
            let declared = content_type.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
            return Err(RelayError::UnsupportedMediaType(declared));
        }

        return field
            .bytes()
            .await
            .map_err(|error| RelayError::Multipart(error.body_text()));
    }

    Err(RelayError::MissingVideo)
}

async fn process_and_read(
    state: &AppState,
    video: Bytes,
    scope: &ScopedDir,
) -> Result<Vec<u8>, RelayError> {
    let output_path = state.processor.run(video, scope).await?;

    let mut file = tokio::fs::File::open(&output_path).await.map_err(|error| {
        warn!(request_id = %scope.request_id(), ?output_path, %error, "Processor output missing");
        RelayError::OutputMissing(error)
    })?;

    let mut data = Vec::new();
    file.read_to_end(&mut data).await.map_err(|error| {
        warn!(request_id = %scope.request_id(), ?output_path, %error, "Processor output unreadable");
        RelayError::OutputRead(error)
    })?;

    Ok(data)
}

/// Status and headers are final before the body is handed to the server.
fn video_response(data: Vec<u8>) -> Response<Body> {
    let len = data.len();
    let mut res = Response::new(Body::from(data));
    let headers = res.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(VIDEO_MP4));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static(CONTENT_DISPOSITION),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    res
}
