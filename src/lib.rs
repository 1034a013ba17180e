//! Ant - 会话助手的编排与语义路由子系统
//!
//! 模块划分:
//! - **cache**: 记忆化缓存服务（TTL + LRU + single-flight）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、回合状态机、决策层、错误分类、会话登记
//! - **executor**: 工具执行服务（限流 + 超时 + 重试）
//! - **handlers**: 能力端点契约与演示实现（mail / calendar / tasks 等）
//! - **limiter**: 按端点的令牌桶限流
//! - **llm**: LLM 客户端与嵌入网关（OpenAI 兼容 / Mock）
//! - **memory**: 对话历史存储契约与内存实现
//! - **observability**: tracing 初始化
//! - **router**: 语义路由（余弦相似度 + 置信阈值兜底）

pub mod cache;
pub mod config;
pub mod core;
pub mod executor;
pub mod handlers;
pub mod limiter;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod router;
