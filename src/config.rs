//! 配置加载
//!
//! 配置来源优先级：环境变量（ANT 前缀，`__` 分节）> 配置文件 > 内置默认值。
//! 例如 ANT__LIMITER__CAPACITY=10 覆盖 [limiter] capacity。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::core::{AgentError, OrchestratorConfig};
use crate::executor::RetryPolicy;
use crate::limiter::LimiterConfig;
use crate::router::RouterConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSettings {
    /// "openai" 或 "mock"
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_failure_grace_secs")]
    pub failure_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_handler_name")]
    pub default_handler: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "default_bucket_capacity")]
    pub capacity: f64,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_max_waiters")]
    pub max_waiters: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_app")]
    pub app: AppSettings,
    #[serde(default = "default_llm")]
    pub llm: LlmSettings,
    #[serde(default = "default_embedding")]
    pub embedding: EmbeddingSettings,
    #[serde(default = "default_cache")]
    pub cache: CacheSettings,
    #[serde(default = "default_router")]
    pub router: RouterSettings,
    #[serde(default = "default_limiter")]
    pub limiter: LimiterSettings,
    #[serde(default = "default_executor")]
    pub executor: ExecutorSettings,
    #[serde(default = "default_orchestrator")]
    pub orchestrator: OrchestratorSettings,
}

fn default_app_name() -> String {
    "ant".to_string()
}
fn default_provider() -> String {
    "mock".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_cache_capacity() -> usize {
    1024
}
fn default_cache_ttl_secs() -> u64 {
    600
}
fn default_failure_grace_secs() -> u64 {
    5
}
fn default_confidence_threshold() -> f32 {
    0.35
}
fn default_handler_name() -> String {
    "chat".to_string()
}
fn default_bucket_capacity() -> f64 {
    5.0
}
fn default_refill_per_sec() -> f64 {
    2.0
}
fn default_max_wait_ms() -> u64 {
    10_000
}
fn default_max_waiters() -> usize {
    32
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_max_iterations() -> usize {
    8
}
fn default_max_concurrent_tools() -> usize {
    4
}

fn default_app() -> AppSettings {
    AppSettings {
        name: default_app_name(),
    }
}
fn default_llm() -> LlmSettings {
    LlmSettings {
        provider: default_provider(),
        model: default_chat_model(),
        base_url: None,
    }
}
fn default_embedding() -> EmbeddingSettings {
    EmbeddingSettings {
        model: default_embedding_model(),
    }
}
fn default_cache() -> CacheSettings {
    CacheSettings {
        capacity: default_cache_capacity(),
        ttl_secs: default_cache_ttl_secs(),
        failure_grace_secs: default_failure_grace_secs(),
    }
}
fn default_router() -> RouterSettings {
    RouterSettings {
        confidence_threshold: default_confidence_threshold(),
        default_handler: default_handler_name(),
    }
}
fn default_limiter() -> LimiterSettings {
    LimiterSettings {
        capacity: default_bucket_capacity(),
        refill_per_sec: default_refill_per_sec(),
        max_wait_ms: default_max_wait_ms(),
        max_waiters: default_max_waiters(),
    }
}
fn default_executor() -> ExecutorSettings {
    ExecutorSettings {
        max_attempts: default_max_attempts(),
        base_delay_ms: default_base_delay_ms(),
        max_delay_ms: default_max_delay_ms(),
        call_timeout_secs: default_call_timeout_secs(),
    }
}
fn default_orchestrator() -> OrchestratorSettings {
    OrchestratorSettings {
        max_iterations: default_max_iterations(),
        max_concurrent_tools: default_max_concurrent_tools(),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app: default_app(),
            llm: default_llm(),
            embedding: default_embedding(),
            cache: default_cache(),
            router: default_router(),
            limiter: default_limiter(),
            executor: default_executor(),
            orchestrator: default_orchestrator(),
        }
    }
}

impl Settings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache.capacity,
            ttl: Duration::from_secs(self.cache.ttl_secs),
            failure_grace: Duration::from_secs(self.cache.failure_grace_secs),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            confidence_threshold: self.router.confidence_threshold,
            default_handler: self.router.default_handler.clone(),
        }
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            capacity: self.limiter.capacity,
            refill_per_sec: self.limiter.refill_per_sec,
            max_wait: Duration::from_millis(self.limiter.max_wait_ms),
            max_waiters: self.limiter.max_waiters,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.executor.max_attempts,
            base_delay: Duration::from_millis(self.executor.base_delay_ms),
            max_delay: Duration::from_millis(self.executor.max_delay_ms),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.call_timeout_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_iterations: self.orchestrator.max_iterations,
            max_concurrent_tools: self.orchestrator.max_concurrent_tools,
        }
    }
}

/// 加载配置：可选配置文件 + ANT 前缀环境变量覆盖
pub fn load_config(path: Option<PathBuf>) -> Result<Settings, AgentError> {
    let mut builder = config::Config::builder();

    if let Some(path) = &path {
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    } else {
        builder = builder.add_source(config::File::with_name("config/default").required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANT")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder
        .build()
        .map_err(|e| AgentError::ConfigError(e.to_string()))?;
    config
        .try_deserialize()
        .map_err(|e| AgentError::ConfigError(e.to_string()))
}
