//! 回合内错误恢复策略
//!
//! 推理输出解析失败时给模型一次纠偏机会（回灌格式提示后重试）；
//! 模型本身出错则放弃本回合，走回合级失败路径。

use crate::core::AgentError;

/// 推理阶段出错后的处理方式
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnRecovery {
    /// 向模型回灌一条纠偏提示后重试
    Reprompt(String),
    /// 放弃本回合
    GiveUp,
}

/// 根据错误决定恢复方式
pub fn recover(error: &AgentError) -> TurnRecovery {
    match error {
        AgentError::PlanParse(detail) => TurnRecovery::Reprompt(format!(
            "Your previous reply could not be parsed ({detail}). Reply with a single JSON \
             object: {{\"calls\":[...]}} to invoke tools or {{\"respond\":\"...\"}} to answer."
        )),
        _ => TurnRecovery::GiveUp,
    }
}
