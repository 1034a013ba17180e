//! 回合状态机与工具调用记录
//!
//! TurnPhase 对应单回合的处理阶段：Idle → Routing → Executing → Reasoning →
//! Responding → Idle，Error 为回合级终态（会话本身回到 Idle）。
//! Turn 追加后不可变；ToolCall 由编排器创建，仅执行服务在执行期间修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 回合处理阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TurnPhase {
    Idle,
    Routing,
    Executing,
    Reasoning,
    Responding,
    /// 回合级错误终态：回合以用户可见的失败说明结束
    Error,
}

/// 回合角色（与对话历史一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// 一条回合记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 本回合内发出的工具调用（仅 Tool 角色的回合携带）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// 推理轮数耗尽后的降级回答标记
    #[serde(default)]
    pub degraded: bool,
}

impl Turn {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            degraded: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn flag_degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}

/// 工具调用结果
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    /// 尚未执行
    Pending,
    Success(Value),
    Failed(String),
}

/// 工具调用记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    /// 目标端点名
    pub handler: String,
    /// 操作名
    pub operation: String,
    pub args: Value,
    /// 已尝试次数（执行服务维护，不超过配置的重试上限）
    pub attempts: u32,
    pub outcome: ToolOutcome,
    pub elapsed_ms: u64,
}

impl ToolCall {
    pub fn new(handler: impl Into<String>, operation: impl Into<String>, args: Value) -> Self {
        Self {
            handler: handler.into(),
            operation: operation.into(),
            args,
            attempts: 0,
            outcome: ToolOutcome::Pending,
            elapsed_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success(_))
    }
}
