//! Optional capture of GitHub traffic as JSON lines.
//!
//! Recordings are the raw material for new pull request fixtures.

pub mod logger;
pub mod middleware;
pub mod sanitizer;
pub mod types;

pub use logger::RecordingLogger;
pub use middleware::RecordingMiddleware;
pub use sanitizer::Sanitizer;
pub use types::*;
