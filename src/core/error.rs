//! 编排层错误类型与瞬时/永久分类
//!
//! 瞬时错误（超时、限流、端点临时不可用）由执行服务内部重试；
//! 永久错误（鉴权、参数、操作不存在）不重试，立即上浮到 Reasoning。

use thiserror::Error;

/// 编排核心的统一错误分类
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 嵌入后端调用失败（原样透传，不在网关内重试）
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// 限流等待超过配置上限
    #[error("Rate limit wait timed out for handler '{0}'")]
    RateLimitTimeout(String),

    /// 限流等待队列已满，立即拒绝
    #[error("Backpressure: wait queue full for handler '{0}'")]
    Backpressure(String),

    /// 单次工具调用超时
    #[error("Tool call timed out: {0}")]
    ToolTimeout(String),

    /// 端点报告临时不可用（含上游限流）
    #[error("Handler temporarily unavailable: {0}")]
    HandlerUnavailable(String),

    #[error("Tool auth error: {0}")]
    ToolAuthError(String),

    #[error("Tool invalid arguments: {0}")]
    ToolInvalidArgs(String),

    /// 目标端点未注册，或端点不支持该操作
    #[error("Unknown tool or handler: {0}")]
    UnknownTool(String),

    /// 瞬时错误重试次数用尽，携带最后一次失败原因
    #[error("Tool failed after {attempts} attempts: {cause}")]
    ToolFailed { attempts: u32, cause: String },

    /// 单回合推理轮数超过上限（降级回答，非致命）
    #[error("Reasoning loop exceeded {0} iterations")]
    LoopExceeded(usize),

    /// 推理模型输出无法解析为合法决策
    #[error("Planner output parse error: {0}")]
    PlanParse(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Cancelled")]
    Cancelled,

    /// 历史存储读写失败
    #[error("Turn store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 瞬时错误：重试可能成功
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::RateLimitTimeout(_)
                | AgentError::Backpressure(_)
                | AgentError::ToolTimeout(_)
                | AgentError::HandlerUnavailable(_)
        )
    }

    /// 永久错误：换输入或换端点之前不会成功
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AgentError::ToolAuthError(_)
                | AgentError::ToolInvalidArgs(_)
                | AgentError::UnknownTool(_)
        )
    }
}
