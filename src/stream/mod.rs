pub mod sse;
pub mod transcoder;

pub use sse::SseLineScanner;
pub use transcoder::{TranscodeSession, TranscodingWriter};
