pub mod orchestrator;
pub mod prompt;
pub mod sanitize;

pub use orchestrator::{GenerationRequest, Generator, UploadedFile};
