//! Mock 后端（用于测试与无 API Key 的本地运行）
//!
//! MockLlmClient 回显用户最后一条消息；MockEmbedder 按关键词命中把文本
//! 投影到固定语义轴上，使路由行为可预期、可断言。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChatMessage, ChatRole, EmbeddingClient, LlmClient};

/// Mock LLM：以 {"respond": "..."} 形式回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(serde_json::json!({
            "respond": format!("(mock) You said: {last_user}")
        })
        .to_string())
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn futures_util::Stream<Item = Result<String, String>> + Send>>, String>
    {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}

/// 语义轴：每个能力域对应一个维度
const AXES: &[(usize, &[&str])] = &[
    // mail
    (0, &["mail", "email", "inbox", "unread", "reply"]),
    // calendar
    (1, &["calendar", "meeting", "schedule", "reschedule", "appointment", "event", "tomorrow", "pm", "am"]),
    // repo
    (2, &["commit", "branch", "merge", "pull", "repo", "repository", "diff"]),
    // tasks
    (3, &["task", "todo", "ticket", "backlog", "done"]),
    // docs
    (4, &["document", "doc", "file", "folder", "upload"]),
    // messaging
    (5, &["message", "chat", "dm", "channel", "ping"]),
];

/// 关键词投影式 Mock 嵌入器：同域查询彼此靠近，跨域查询彼此远离
#[derive(Debug, Default)]
pub struct MockEmbedder;

impl MockEmbedder {
    pub const DIMS: usize = 8;

    /// 某个能力域的单位质心（供注册端点时使用）
    pub fn centroid(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; Self::DIMS];
        if axis < Self::DIMS {
            v[axis] = 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbedder {
    fn model_version(&self) -> &str {
        "mock-embed-v1"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let lower = text.to_lowercase();
        let mut v = vec![0.0f32; Self::DIMS];
        for (axis, keywords) in AXES {
            for keyword in *keywords {
                if lower.contains(keyword) {
                    v[*axis] += 1.0;
                }
            }
        }
        // 无关键词命中时给最后一维一个小分量，避免零向量
        if v.iter().all(|x| *x == 0.0) {
            v[Self::DIMS - 1] = 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        Ok(v)
    }
}
