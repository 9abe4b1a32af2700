pub mod middleware;
pub mod routes;
pub mod token_bucket;

pub use middleware::log_request_errors;
pub use routes::{serve_video, upload_video, waitlist};
pub use token_bucket::TokenBucket;
