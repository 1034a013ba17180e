//! 能力端点契约
//!
//! 每个能力端点（mail / calendar / repo / tasks / docs / messaging）实现
//! CapabilityHandler：list_tools 报告可调用操作，invoke 执行单个操作。
//! 端点通过 HandlerError 自报失败的可重试性，供执行服务分类消费。

pub mod demo;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use demo::DemoHandler;

/// 单个可调用操作的 schema（名称 + 描述 + 参数 JSON Schema）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema；默认空对象表示无参数
    #[serde(default = "default_parameters")]
    pub parameters: Value,
}

fn default_parameters() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: default_parameters(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// 端点自报的错误，携带瞬时/永久分类
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// 鉴权失败（永久）
    #[error("auth failed: {0}")]
    Auth(String),

    /// 参数不合法（永久）
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// 操作不存在（永久）
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// 临时不可用（瞬时，可重试）
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    /// 上游限流（瞬时，可重试）
    #[error("rate limited by upstream")]
    RateLimited,
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Unavailable(_) | HandlerError::RateLimited)
    }
}

/// 能力端点 trait：名称、操作列表、执行
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// 端点名（路由与限流共用的 key）
    fn name(&self) -> &str;

    /// 支持的操作列表
    fn list_tools(&self) -> Vec<ToolSchema>;

    /// 执行一个操作
    async fn invoke(&self, operation: &str, args: Value) -> Result<Value, HandlerError>;
}

/// 端点注册表：按名称存储 Arc<dyn CapabilityHandler>
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CapabilityHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_classification() {
        assert!(HandlerError::Unavailable("503".into()).is_transient());
        assert!(HandlerError::RateLimited.is_transient());
        assert!(!HandlerError::Auth("token expired".into()).is_transient());
        assert!(!HandlerError::InvalidArgs("missing field".into()).is_transient());
        assert!(!HandlerError::UnknownOperation("teleport".into()).is_transient());
    }

    #[test]
    fn test_tool_schema_defaults() {
        let schema = ToolSchema::new("send_mail", "Send an email");
        assert_eq!(schema.parameters["type"], "object");

        let schema = schema.with_parameters(serde_json::json!({
            "type": "object",
            "properties": {"to": {"type": "string"}},
            "required": ["to"]
        }));
        assert_eq!(schema.parameters["required"][0], "to");
    }

    #[tokio::test]
    async fn test_registry_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(demo::DemoHandler::mail()));
        assert!(registry.contains("mail"));
        assert!(registry.get("calendar").is_none());
        let handler = registry.get("mail").unwrap();
        assert!(!handler.list_tools().is_empty());
    }
}
