//! LLM 层：推理客户端与嵌入网关（OpenAI 兼容 / Mock）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{EmbeddingClient, EmbeddingGateway, OpenAiEmbedder};
pub use mock::{MockEmbedder, MockLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChatMessage, ChatRole, LlmClient};
