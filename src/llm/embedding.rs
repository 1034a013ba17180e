//! 嵌入网关：外部 /embeddings 调用 + 缓存
//!
//! embed(text) 先做归一化（小写 + 去首尾空白），以 sha256(归一化文本, 模型版本)
//! 为 key 经缓存服务记忆化；同一语义查询共享缓存条目。后端错误原样透传，
//! 网关内不做重试（重试若需要发生在调用方路径上）。

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::cache::CacheService;
use crate::core::AgentError;

/// 嵌入后端契约：文本 → 定长向量
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// 模型版本标识，参与缓存 key
    fn model_version(&self) -> &str;

    /// 将文本编码为向量；失败时返回错误字符串
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    fn model_version(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        if text.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| e.to_string())?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;
        let vec = response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .unwrap_or_default();
        Ok(vec)
    }
}

/// 嵌入网关：后端调用经缓存服务记忆化（single-flight）
pub struct EmbeddingGateway {
    client: Arc<dyn EmbeddingClient>,
    cache: Arc<CacheService<Vec<f32>>>,
}

impl EmbeddingGateway {
    pub fn new(client: Arc<dyn EmbeddingClient>, cache: Arc<CacheService<Vec<f32>>>) -> Self {
        Self { client, cache }
    }

    /// 归一化：小写 + 去首尾空白，使语义相同的查询共享缓存条目
    fn normalize(text: &str) -> String {
        text.trim().to_lowercase()
    }

    fn cache_key(normalized: &str, model_version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model_version.as_bytes());
        hasher.update(b"\n");
        hasher.update(normalized.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        let normalized = Self::normalize(text);
        let key = Self::cache_key(&normalized, self.client.model_version());
        let client = self.client.clone();
        self.cache
            .get_or_compute(&key, move || async move { client.embed(&normalized).await })
            .await
            .map_err(AgentError::EmbeddingUnavailable)
    }

    /// 缓存命中/未命中计数
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::llm::MockEmbedder;

    fn gateway() -> EmbeddingGateway {
        EmbeddingGateway::new(
            Arc::new(MockEmbedder::default()),
            Arc::new(CacheService::new(CacheConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_embed_returns_fixed_length_vector() {
        let gateway = gateway();
        let v = gateway.embed("check my email inbox").await.unwrap();
        assert_eq!(v.len(), MockEmbedder::DIMS);
    }

    #[tokio::test]
    async fn test_normalized_queries_share_cache_entry() {
        let gateway = gateway();
        let a = gateway.embed("Check my Inbox").await.unwrap();
        let b = gateway.embed("  check my inbox  ").await.unwrap();
        assert_eq!(a, b);
        let (hits, misses) = gateway.cache_stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn test_cache_key_includes_model_version() {
        let a = EmbeddingGateway::cache_key("hello", "model-v1");
        let b = EmbeddingGateway::cache_key("hello", "model-v2");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_backend_error_propagates_unchanged() {
        struct FailingEmbedder;

        #[async_trait]
        impl EmbeddingClient for FailingEmbedder {
            fn model_version(&self) -> &str {
                "failing-v1"
            }
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
                Err("connection refused".to_string())
            }
        }

        let gateway = EmbeddingGateway::new(
            Arc::new(FailingEmbedder),
            Arc::new(CacheService::new(CacheConfig::default())),
        );
        let err = gateway.embed("anything").await.unwrap_err();
        match err {
            AgentError::EmbeddingUnavailable(msg) => assert_eq!(msg, "connection refused"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
