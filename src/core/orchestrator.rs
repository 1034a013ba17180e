//! 编排器：单回合状态机与推理循环
//!
//! 一条用户消息的处理流程：Routing（语义路由选端点）→ 有界推理循环
//! （Reasoning 产出决策，Executing 执行工具调用并回灌结果）→ Responding
//! 落盘回答 → Idle。同会话消息经公平锁严格 FIFO；跨会话并发。
//!
//! 失败语义：
//! - 工具永久失败首次出现时回灌给模型绕行；同一 (端点, 操作) 第二次
//!   永久失败则进入 Error，回合以失败说明结束。
//! - 推理轮数到达上限时降级回答（承认未完成），不算回合失败。
//! - 取消随时生效：执行与退避中断，回合以 "(cancelled)" 记录收尾。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::planner::{PlanContext, Planner, PlannerDecision, ToolCallRequest};
use crate::core::recovery::{recover, TurnRecovery};
use crate::core::{AgentError, SessionRegistry, ToolCall, Turn, TurnPhase};
use crate::executor::AgentExecutor;
use crate::handlers::HandlerRegistry;
use crate::memory::TurnStore;
use crate::router::Router;

/// 编排参数
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// 单回合推理循环轮数上限
    pub max_iterations: usize,
    /// 全局同时在途的工具调用数上限
    pub max_concurrent_tools: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_concurrent_tools: 4,
        }
    }
}

/// 会话编排器
pub struct Orchestrator {
    router: Arc<Router>,
    handlers: Arc<HandlerRegistry>,
    executor: Arc<AgentExecutor>,
    planner: Arc<dyn Planner>,
    store: Arc<dyn TurnStore>,
    sessions: Arc<SessionRegistry>,
    tool_pool: Arc<Semaphore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        router: Arc<Router>,
        handlers: Arc<HandlerRegistry>,
        executor: Arc<AgentExecutor>,
        planner: Arc<dyn Planner>,
        store: Arc<dyn TurnStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            router,
            handlers,
            executor,
            planner,
            store,
            sessions: Arc::new(SessionRegistry::new()),
            tool_pool: Arc::new(Semaphore::new(config.max_concurrent_tools)),
            config,
        }
    }

    /// 取消指定会话当前在途的回合
    pub fn cancel(&self, session_id: &str) {
        self.sessions.cancel(session_id);
    }

    /// 指定会话当前的回合阶段
    pub fn phase(&self, session_id: &str) -> TurnPhase {
        self.sessions.phase(session_id)
    }

    /// 会话完整历史
    pub async fn history(&self, session_id: &str) -> Result<Vec<Turn>, AgentError> {
        self.store
            .load_history(session_id)
            .await
            .map_err(AgentError::Store)
    }

    /// 处理一条用户消息，返回最终的 assistant 回合
    ///
    /// 同会话并发调用按到达顺序排队；本方法返回时会话已回到 Idle。
    pub async fn handle_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<Turn, AgentError> {
        let session = self.sessions.session(session_id);
        // 公平锁：同会话回合严格按排队顺序执行
        let mut session = session.lock().await;
        // 令牌在拿到回合锁之后签发，取消只作用于在途回合
        let cancel = self.sessions.begin_turn_token(session_id);

        let result = self
            .run_turn(session_id, text, &mut session.failed_ops, &cancel)
            .await;

        match result {
            Ok(turn) => {
                self.sessions.set_phase(session_id, TurnPhase::Idle);
                Ok(turn)
            }
            Err(AgentError::Cancelled) => {
                let turn = Turn::assistant("(cancelled)");
                let _ = self.store.append_turn(session_id, &turn).await;
                self.sessions.set_phase(session_id, TurnPhase::Idle);
                Err(AgentError::Cancelled)
            }
            // 回合级失败：以失败说明收尾，会话继续可用
            Err(e) => {
                self.sessions.set_phase(session_id, TurnPhase::Error);
                let turn = self.fail_turn(session_id, &e).await;
                self.sessions.set_phase(session_id, TurnPhase::Idle);
                Ok(turn)
            }
        }
    }

    async fn run_turn(
        &self,
        session_id: &str,
        text: &str,
        failed_ops: &mut std::collections::HashSet<(String, String)>,
        cancel: &CancellationToken,
    ) -> Result<Turn, AgentError> {
        self.sessions.set_phase(session_id, TurnPhase::Routing);
        let user_turn = Turn::user(text);
        self.append(session_id, &user_turn).await?;

        let decision = self.router.route(text).await?;
        let tools = self.router.tools_for(&decision.handler);
        let mut history = self
            .store
            .load_history(session_id)
            .await
            .map_err(AgentError::Store)?;

        for iteration in 0..self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            self.sessions.set_phase(session_id, TurnPhase::Reasoning);
            let context = PlanContext {
                handler: &decision.handler,
                tools: &tools,
                history: &history,
            };
            let plan = match self.planner.plan(&context).await {
                Ok(plan) => plan,
                Err(e) => match recover(&e) {
                    TurnRecovery::Reprompt(prompt) => {
                        tracing::warn!(session = session_id, iteration, error = %e, "replanning");
                        // 纠偏提示只进本回合的工作历史，不落盘
                        history.push(Turn::user(prompt));
                        continue;
                    }
                    TurnRecovery::GiveUp => return Err(e),
                },
            };

            match plan {
                PlannerDecision::Respond(answer) => {
                    return self.respond(session_id, answer).await;
                }
                PlannerDecision::ToolCalls(requests) => {
                    self.sessions.set_phase(session_id, TurnPhase::Executing);
                    let results = self
                        .execute_batch(&decision.handler, requests, cancel)
                        .await?;

                    // 同一组合第二次永久失败：放弃本回合
                    for (call, error) in &results {
                        let permanent = matches!(
                            error,
                            Some(e) if e.is_permanent()
                        );
                        if permanent {
                            let key = (call.handler.clone(), call.operation.clone());
                            if !failed_ops.insert(key) {
                                return Err(AgentError::ToolFailed {
                                    attempts: call.attempts,
                                    cause: format!(
                                        "{}::{} failed permanently twice: {}",
                                        call.handler,
                                        call.operation,
                                        error.as_ref().map(|e| e.to_string()).unwrap_or_default()
                                    ),
                                });
                            }
                        }
                    }

                    let tool_turn = Self::tool_turn(&results);
                    self.append(session_id, &tool_turn).await?;
                    history.push(tool_turn);
                }
            }
        }

        // 轮数耗尽：降级回答（带标记），承认未完成
        let exceeded = AgentError::LoopExceeded(self.config.max_iterations);
        tracing::warn!(session = session_id, error = %exceeded, "responding degraded");
        self.sessions.set_phase(session_id, TurnPhase::Responding);
        let turn = Turn::assistant(format!(
            "I wasn't able to fully complete this request within {} reasoning steps. \
             The tool results gathered so far are recorded above.",
            self.config.max_iterations
        ))
        .flag_degraded();
        self.append(session_id, &turn).await?;
        Ok(turn)
    }

    /// 执行一批工具调用：同端点串行，跨端点并发，全局并发受池限制
    async fn execute_batch(
        &self,
        routed_handler: &str,
        requests: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(ToolCall, Option<AgentError>)>, AgentError> {
        let mut groups: HashMap<String, Vec<ToolCall>> = HashMap::new();
        for request in requests {
            let handler = request
                .handler
                .unwrap_or_else(|| routed_handler.to_string());
            let args = if request.args.is_null() {
                serde_json::json!({})
            } else {
                request.args
            };
            groups
                .entry(handler.clone())
                .or_default()
                .push(ToolCall::new(handler, request.operation, args));
        }

        let futures = groups.into_iter().map(|(handler_name, calls)| {
            let executor = self.executor.clone();
            let handlers = self.handlers.clone();
            let pool = self.tool_pool.clone();
            let cancel = cancel.clone();
            async move {
                let mut results = Vec::with_capacity(calls.len());
                for mut call in calls {
                    let Some(handler) = handlers.get(&handler_name) else {
                        let error = AgentError::UnknownTool(handler_name.clone());
                        call.outcome =
                            crate::core::ToolOutcome::Failed(error.to_string());
                        results.push((call, Some(error)));
                        continue;
                    };
                    let _permit = pool.acquire().await.expect("semaphore closed");
                    let outcome = executor.execute(handler, &mut call, &cancel).await;
                    results.push((call, outcome.err()));
                }
                results
            }
        });

        let mut all: Vec<(ToolCall, Option<AgentError>)> =
            join_all(futures).await.into_iter().flatten().collect();

        if all
            .iter()
            .any(|(_, e)| matches!(e, Some(AgentError::Cancelled)))
        {
            return Err(AgentError::Cancelled);
        }
        // 稳定顺序，方便断言与阅读
        all.sort_by(|(a, _), (b, _)| {
            (a.handler.as_str(), a.operation.as_str())
                .cmp(&(b.handler.as_str(), b.operation.as_str()))
        });
        Ok(all)
    }

    /// 把一批执行结果汇总成一条 Tool 回合
    fn tool_turn(results: &[(ToolCall, Option<AgentError>)]) -> Turn {
        let summary: Vec<Value> = results
            .iter()
            .map(|(call, error)| {
                let result = match &call.outcome {
                    crate::core::ToolOutcome::Success(v) => v.clone(),
                    crate::core::ToolOutcome::Failed(msg) => Value::String(msg.clone()),
                    crate::core::ToolOutcome::Pending => Value::Null,
                };
                serde_json::json!({
                    "handler": call.handler,
                    "operation": call.operation,
                    "ok": error.is_none(),
                    "result": result,
                })
            })
            .collect();
        let calls = results.iter().map(|(call, _)| call.clone()).collect();
        Turn::tool(Value::Array(summary).to_string()).with_tool_calls(calls)
    }

    async fn respond(&self, session_id: &str, answer: String) -> Result<Turn, AgentError> {
        self.sessions.set_phase(session_id, TurnPhase::Responding);
        let turn = Turn::assistant(answer);
        self.append(session_id, &turn).await?;
        Ok(turn)
    }

    /// 回合级失败收尾：落盘一条用户可读的失败说明
    async fn fail_turn(&self, session_id: &str, error: &AgentError) -> Turn {
        tracing::error!(session = session_id, error = %error, "turn failed");
        let turn = Turn::assistant(format!("I couldn't complete that request: {error}"));
        let _ = self.store.append_turn(session_id, &turn).await;
        turn
    }

    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), AgentError> {
        self.store
            .append_turn(session_id, turn)
            .await
            .map_err(AgentError::Store)
    }
}
