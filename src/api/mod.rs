pub mod middleware;
pub mod routes;

pub use middleware::log_relay_requests;
pub(crate) use routes::analyze_video;
pub use routes::{VIDEO_FIELD, VIDEO_MP4};
