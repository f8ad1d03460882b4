mod chat;
mod error;
mod profile;
mod retry;

pub use chat::{create_chat_adapter, create_chat_adapter_from_profile};
pub use error::AdapterError;
pub use profile::{normalize_base_url, ProfileStore, ProviderConfig};
pub use retry::{call_with_retry, RetryConfig};

pub use factorlens_core::{ChatModel, ChatModelError, ChatReply, TokenUsage};
