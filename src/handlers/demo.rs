//! 演示端点：返回固定数据的内置能力端点
//!
//! 供 REPL 演示与集成测试使用；真实的 mail / calendar 等端点是外部协作方，
//! 只需实现 CapabilityHandler 契约即可接入。

use async_trait::async_trait;
use serde_json::Value;

use crate::handlers::{CapabilityHandler, HandlerError, ToolSchema};

/// 按操作名返回固定 JSON 的端点
pub struct DemoHandler {
    name: String,
    tools: Vec<ToolSchema>,
    responses: Vec<(String, Value)>,
}

impl DemoHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            responses: Vec::new(),
        }
    }

    /// 注册一个操作及其固定响应
    pub fn with_operation(mut self, schema: ToolSchema, response: Value) -> Self {
        self.responses.push((schema.name.clone(), response));
        self.tools.push(schema);
        self
    }

    /// 邮件演示端点
    pub fn mail() -> Self {
        Self::new("mail")
            .with_operation(
                ToolSchema::new("list_inbox", "List recent messages in the inbox"),
                serde_json::json!({"messages": [
                    {"from": "alice@example.com", "subject": "Quarterly report"},
                    {"from": "bob@example.com", "subject": "Lunch tomorrow?"}
                ]}),
            )
            .with_operation(
                ToolSchema::new("send_mail", "Send an email").with_parameters(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "to": {"type": "string"},
                        "subject": {"type": "string"},
                        "body": {"type": "string"}
                    },
                    "required": ["to", "subject"]
                })),
                serde_json::json!({"sent": true}),
            )
    }

    /// 日历演示端点
    pub fn calendar() -> Self {
        Self::new("calendar")
            .with_operation(
                ToolSchema::new("list_events", "List upcoming calendar events"),
                serde_json::json!({"events": [
                    {"id": 7, "title": "Team sync", "start": "2026-08-31T15:00:00Z"}
                ]}),
            )
            .with_operation(
                ToolSchema::new("reschedule_event", "Move an event to a new time")
                    .with_parameters(serde_json::json!({
                        "type": "object",
                        "properties": {
                            "id": {"type": "integer"},
                            "start": {"type": "string"}
                        },
                        "required": ["id", "start"]
                    })),
                serde_json::json!({"rescheduled": true}),
            )
    }

    /// 任务演示端点
    pub fn tasks() -> Self {
        Self::new("tasks")
            .with_operation(
                ToolSchema::new("list_tasks", "List open tasks"),
                serde_json::json!({"tasks": [{"id": 1, "title": "Review PR #42"}]}),
            )
            .with_operation(
                ToolSchema::new("create_task", "Create a new task").with_parameters(
                    serde_json::json!({
                        "type": "object",
                        "properties": {"title": {"type": "string"}},
                        "required": ["title"]
                    }),
                ),
                serde_json::json!({"created": true, "id": 2}),
            )
    }
}

#[async_trait]
impl CapabilityHandler for DemoHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_tools(&self) -> Vec<ToolSchema> {
        self.tools.clone()
    }

    async fn invoke(&self, operation: &str, _args: Value) -> Result<Value, HandlerError> {
        self.responses
            .iter()
            .find(|(name, _)| name == operation)
            .map(|(_, response)| response.clone())
            .ok_or_else(|| HandlerError::UnknownOperation(operation.to_string()))
    }
}
