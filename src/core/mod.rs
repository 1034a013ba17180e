//! 编排核心：错误分类、回合状态、决策层、会话登记与编排器

pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod session;
pub mod state;

pub use error::AgentError;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use planner::{LlmPlanner, PlanContext, Planner, PlannerDecision, ScriptedPlanner, ToolCallRequest};
pub use recovery::{recover, TurnRecovery};
pub use session::{ConversationSession, SessionRegistry};
pub use state::{Role, ToolCall, ToolOutcome, Turn, TurnPhase};
