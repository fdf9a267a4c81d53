pub mod chat;
pub mod delta;
pub mod request;

pub use chat::{ ChatMessage, Role };
pub use delta::{ normalize, ChannelDelta, RawDelta, Token };
pub use request::{ InferenceRequest, JobRequest, RequestInput, SamplingParams, ValidatedRequest };
