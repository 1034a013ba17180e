//! 会话登记与回合串行化
//!
//! 每个会话持有一把公平互斥锁：同会话消息严格 FIFO 处理，跨会话并发。
//! 取消令牌与回合锁分开存放，取消请求无需等待正在进行的回合释放锁。
//! 回合阶段同样旁路存放，供外部随时观测。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::TurnPhase;

/// 单个会话的回合内状态
pub struct ConversationSession {
    pub id: String,
    /// 本会话内已永久失败的 (端点, 操作) 组合，推理时告知模型绕开
    pub failed_ops: HashSet<(String, String)>,
}

impl ConversationSession {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            failed_ops: HashSet::new(),
        }
    }
}

/// 会话登记表
#[derive(Default)]
pub struct SessionRegistry {
    sessions: StdMutex<HashMap<String, Arc<Mutex<ConversationSession>>>>,
    tokens: StdMutex<HashMap<String, CancellationToken>>,
    phases: StdMutex<HashMap<String, TurnPhase>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取会话（不存在则创建）；tokio Mutex 是公平锁，排队即 FIFO
    pub fn session(&self, id: &str) -> Arc<Mutex<ConversationSession>> {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationSession::new(id))))
            .clone()
    }

    /// 为新回合签发取消令牌（替换上一回合的令牌）
    pub fn begin_turn_token(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .expect("token lock poisoned")
            .insert(id.to_string(), token.clone());
        token
    }

    /// 取消该会话当前回合（无在途回合时为 no-op）
    pub fn cancel(&self, id: &str) {
        if let Some(token) = self.tokens.lock().expect("token lock poisoned").get(id) {
            tracing::info!(session = id, "turn cancelled");
            token.cancel();
        }
    }

    pub fn set_phase(&self, id: &str, phase: TurnPhase) {
        tracing::debug!(session = id, phase = ?phase, "phase");
        self.phases
            .lock()
            .expect("phase lock poisoned")
            .insert(id.to_string(), phase);
    }

    /// 当前回合阶段；未知会话视为 Idle
    pub fn phase(&self, id: &str) -> TurnPhase {
        self.phases
            .lock()
            .expect("phase lock poisoned")
            .get(id)
            .copied()
            .unwrap_or(TurnPhase::Idle)
    }
}
