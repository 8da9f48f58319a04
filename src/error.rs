use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Every way a single `/video` request can fail.
///
/// All failures are terminal for the request. Only the status and a short
/// message reach the client, the wrapped detail is for logs.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("multipart form has no `video` field")]
    MissingVideo,

    #[error("malformed multipart body: {0}")]
    Multipart(String),

    #[error("unsupported content type: {0:?}")]
    UnsupportedMediaType(Option<String>),

    #[error("failed to create scoped output dir")]
    Workspace(#[source] std::io::Error),

    #[error("failed to start processor")]
    ProcessorSpawn(#[source] std::io::Error),

    #[error("processor i/o failed")]
    ProcessorIo(#[source] std::io::Error),

    #[error("processor exited unsuccessfully: {0}")]
    ProcessorFailed(ExitStatus),

    #[error("processor timed out after {0:?}")]
    ProcessorTimeout(Duration),

    #[error("processor permits closed")]
    PermitsClosed,

    #[error("processor output unavailable")]
    OutputMissing(#[source] std::io::Error),

    #[error("failed to read processor output")]
    OutputRead(#[source] std::io::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingVideo | Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Workspace(_)
            | Self::ProcessorSpawn(_)
            | Self::ProcessorIo(_)
            | Self::ProcessorFailed(_)
            | Self::ProcessorTimeout(_)
            | Self::PermitsClosed
            | Self::OutputMissing(_)
            | Self::OutputRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message.
    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingVideo | Self::Multipart(_) => "Could not retrieve video from form",
            Self::UnsupportedMediaType(_) => "Invalid file type, only MP4 is allowed",
            Self::Workspace(_) => "Error preparing video workspace",
            Self::ProcessorSpawn(_)
            | Self::ProcessorIo(_)
            | Self::ProcessorFailed(_)
            | Self::ProcessorTimeout(_)
            | Self::PermitsClosed => "Error analyzing video",
            Self::OutputMissing(_) => "Error reading video",
            Self::OutputRead(_) => "Error reading video content",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response<Body> {
        err_response(self.status(), self.message())
    }
}

pub(crate) fn err_response(status: StatusCode, body_str: &'static str) -> Response<Body> {
    let mut res = Response::new(Body::from(body_str));
    *res.status_mut() = status;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}
