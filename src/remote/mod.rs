pub mod client;
pub mod merge;
pub mod models;
pub mod stream;
pub mod traits;
pub mod types;

pub use client::BackendClient;
pub use merge::{merge_history, MergeReport};
pub use traits::ReplySource;
pub use types::{ContextMessage, RemoteError, ReplyRequest, StreamEvent};
