//! 推理决策层：把对话历史 + 可用工具交给模型，解析出下一步动作
//!
//! 模型输出约定为单个 JSON 对象：{"calls":[{"handler","operation","args"}...]}
//! 表示发起工具调用，{"respond":"..."} 表示直接回答。裸文本视为直接回答；
//! 形似 JSON 但解析失败的输出报 PlanParse，由恢复层决定是否纠偏重试。

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::core::{AgentError, Role, Turn};
use crate::handlers::ToolSchema;
use crate::llm::{ChatMessage, LlmClient};

/// 模型请求的一次工具调用
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ToolCallRequest {
    /// 目标端点；缺省时由编排器填入本回合路由到的端点
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    pub operation: String,
    #[serde(default)]
    pub args: Value,
}

/// 模型输出的线格式
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct WireDecision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    respond: Option<String>,
}

/// 解析后的决策
#[derive(Clone, Debug)]
pub enum PlannerDecision {
    /// 发起一批工具调用，结果回灌后继续推理
    ToolCalls(Vec<ToolCallRequest>),
    /// 直接以该文本回答用户，回合结束
    Respond(String),
}

/// 推理上下文：本回合路由到的端点及其工具、对话历史
pub struct PlanContext<'a> {
    pub handler: &'a str,
    pub tools: &'a [ToolSchema],
    pub history: &'a [Turn],
}

/// 决策来源的抽象（生产走 LLM，测试走脚本）
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, context: &PlanContext<'_>) -> Result<PlannerDecision, AgentError>;
}

/// 从模型原始输出中取出 JSON 块（```json 围栏优先，其次首尾大括号跨度）
fn extract_json_block(raw: &str) -> Option<&str> {
    if let Some(start) = raw.find("```json") {
        let rest = &raw[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(&raw[start..=end])
    } else {
        None
    }
}

/// 解析模型输出为决策
pub fn parse_planner_output(raw: &str) -> Result<PlannerDecision, AgentError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AgentError::PlanParse("empty output".to_string()));
    }

    let Some(block) = extract_json_block(trimmed) else {
        // 裸文本：当作直接回答
        return Ok(PlannerDecision::Respond(trimmed.to_string()));
    };

    let wire: WireDecision = serde_json::from_str(block)
        .map_err(|e| AgentError::PlanParse(format!("invalid decision JSON: {e}")))?;

    match (wire.calls, wire.respond) {
        (Some(calls), _) if !calls.is_empty() => Ok(PlannerDecision::ToolCalls(calls)),
        (_, Some(respond)) => Ok(PlannerDecision::Respond(respond)),
        _ => Err(AgentError::PlanParse(
            "decision has neither 'calls' nor 'respond'".to_string(),
        )),
    }
}

/// 由 LLM 驱动的决策器
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: "You are an assistant that completes user requests by calling tools \
                            or answering directly."
                .to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build_messages(&self, context: &PlanContext<'_>) -> Vec<ChatMessage> {
        let tools_json = serde_json::to_string_pretty(context.tools).unwrap_or_default();
        let format_schema =
            serde_json::to_string(&schema_for!(WireDecision)).unwrap_or_default();
        let system = format!(
            "{}\n\nActive capability: {}\nAvailable tools:\n{}\n\n\
             Reply with a single JSON object matching this schema:\n{}\n\
             Use {{\"calls\":[{{\"operation\":...,\"args\":...}}]}} to invoke tools, \
             or {{\"respond\":\"...\"}} to answer the user directly.",
            self.system_prompt, context.handler, tools_json, format_schema
        );

        let mut messages = vec![ChatMessage::system(system)];
        for turn in context.history {
            messages.push(match turn.role {
                Role::User => ChatMessage::user(turn.content.as_str()),
                Role::Assistant => ChatMessage::assistant(turn.content.as_str()),
                Role::Tool => ChatMessage::user(format!("[tool results] {}", turn.content)),
            });
        }
        messages
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, context: &PlanContext<'_>) -> Result<PlannerDecision, AgentError> {
        let messages = self.build_messages(context);
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(AgentError::LlmError)?;
        parse_planner_output(&raw)
    }
}

/// 脚本化决策器：按顺序吐出预先给定的决策（测试用）
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<PlannerDecision>>,
}

impl ScriptedPlanner {
    pub fn new(decisions: Vec<PlannerDecision>) -> Self {
        Self {
            script: Mutex::new(decisions.into()),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _context: &PlanContext<'_>) -> Result<PlannerDecision, AgentError> {
        Ok(self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| PlannerDecision::Respond("(no scripted decision)".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_calls() {
        let raw = r#"{"calls":[{"handler":"mail","operation":"send_mail","args":{"to":"a@b.c"}}]}"#;
        match parse_planner_output(raw).unwrap() {
            PlannerDecision::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].handler.as_deref(), Some("mail"));
                assert_eq!(calls[0].operation, "send_mail");
                assert_eq!(calls[0].args["to"], "a@b.c");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_parse_respond() {
        match parse_planner_output(r#"{"respond":"done"}"#).unwrap() {
            PlannerDecision::Respond(text) => assert_eq!(text, "done"),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "Here is my decision:\n```json\n{\"respond\":\"hello\"}\n```";
        match parse_planner_output(raw).unwrap() {
            PlannerDecision::Respond(text) => assert_eq!(text, "hello"),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_plain_text_becomes_respond() {
        match parse_planner_output("I cannot help with that.").unwrap() {
            PlannerDecision::Respond(text) => assert_eq!(text, "I cannot help with that."),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = parse_planner_output(r#"{"calls": [{"operation": }"#).unwrap_err();
        assert!(matches!(err, AgentError::PlanParse(_)));

        let err = parse_planner_output(r#"{"something": "else"}"#).unwrap_err();
        assert!(matches!(err, AgentError::PlanParse(_)));

        let err = parse_planner_output("   ").unwrap_err();
        assert!(matches!(err, AgentError::PlanParse(_)));
    }

    #[test]
    fn test_handler_defaults_to_none() {
        let raw = r#"{"calls":[{"operation":"list_inbox"}]}"#;
        match parse_planner_output(raw).unwrap() {
            PlannerDecision::ToolCalls(calls) => {
                assert!(calls[0].handler.is_none());
                assert_eq!(calls[0].args, serde_json::Value::Null);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scripted_planner_pops_in_order() {
        let planner = ScriptedPlanner::new(vec![
            PlannerDecision::Respond("first".to_string()),
            PlannerDecision::Respond("second".to_string()),
        ]);
        let context = PlanContext {
            handler: "mail",
            tools: &[],
            history: &[],
        };
        match planner.plan(&context).await.unwrap() {
            PlannerDecision::Respond(text) => assert_eq!(text, "first"),
            other => panic!("unexpected decision: {other:?}"),
        }
        match planner.plan(&context).await.unwrap() {
            PlannerDecision::Respond(text) => assert_eq!(text, "second"),
            other => panic!("unexpected decision: {other:?}"),
        }
    }
}
