//! 对话历史存储契约与内存实现
//!
//! 编排器只依赖 TurnStore trait：追加回合、按会话读取历史。
//! 默认提供进程内实现；持久化后端可在不改动编排器的情况下替换。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::Turn;

/// 历史存储契约
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// 追加一条回合记录（追加后不可变）
    async fn append_turn(&self, session_id: &str, turn: &Turn) -> Result<(), String>;

    /// 按时间顺序读取会话历史
    async fn load_history(&self, session_id: &str) -> Result<Vec<Turn>, String>;
}

/// 进程内实现：按会话 ID 分桶的回合列表
#[derive(Default)]
pub struct InMemoryTurnStore {
    turns: RwLock<HashMap<String, Vec<Turn>>>,
}

impl InMemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for InMemoryTurnStore {
    async fn append_turn(&self, session_id: &str, turn: &Turn) -> Result<(), String> {
        self.turns
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<Turn>, String> {
        Ok(self
            .turns
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
