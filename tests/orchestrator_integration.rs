//! 编排器端到端测试：脚本化决策器 + Mock 嵌入驱动完整回合

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use ant::cache::{CacheConfig, CacheService};
use ant::core::{
    AgentError, Orchestrator, OrchestratorConfig, Planner, PlannerDecision, Role, ToolCallRequest,
    TurnPhase,
};
use ant::executor::{AgentExecutor, RetryPolicy};
use ant::handlers::{CapabilityHandler, DemoHandler, HandlerError, HandlerRegistry, ToolSchema};
use ant::limiter::{LimiterConfig, RateLimiter};
use ant::llm::{EmbeddingGateway, MockEmbedder};
use ant::memory::InMemoryTurnStore;
use ant::router::{CapabilityDescriptor, Router, RouterConfig};

/// 固定延迟的端点，记录并发水位
struct SlowHandler {
    name: String,
    delay: Duration,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl SlowHandler {
    fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl CapabilityHandler for SlowHandler {
    fn name(&self) -> &str {
        &self.name
    }
    fn list_tools(&self) -> Vec<ToolSchema> {
        vec![ToolSchema::new("work", "Do some slow work")]
    }
    async fn invoke(&self, _operation: &str, _args: Value) -> Result<Value, HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::json!({"done": true}))
    }
}

/// 所有操作都鉴权失败的端点
struct AuthFailHandler;

#[async_trait]
impl CapabilityHandler for AuthFailHandler {
    fn name(&self) -> &str {
        "mail"
    }
    fn list_tools(&self) -> Vec<ToolSchema> {
        vec![ToolSchema::new("send_mail", "Send an email")]
    }
    async fn invoke(&self, _operation: &str, _args: Value) -> Result<Value, HandlerError> {
        Err(HandlerError::Auth("token expired".to_string()))
    }
}

fn call(operation: &str) -> ToolCallRequest {
    ToolCallRequest {
        handler: None,
        operation: operation.to_string(),
        args: serde_json::json!({}),
    }
}

fn call_on(handler: &str, operation: &str) -> ToolCallRequest {
    ToolCallRequest {
        handler: Some(handler.to_string()),
        operation: operation.to_string(),
        args: serde_json::json!({}),
    }
}

fn build(
    handlers: Vec<Arc<dyn CapabilityHandler>>,
    planner: Arc<dyn Planner>,
    max_iterations: usize,
) -> Arc<Orchestrator> {
    let gateway = Arc::new(EmbeddingGateway::new(
        Arc::new(MockEmbedder::default()),
        Arc::new(CacheService::new(CacheConfig::default())),
    ));
    let router = Arc::new(Router::new(
        gateway,
        RouterConfig {
            confidence_threshold: 0.0,
            default_handler: "chat".to_string(),
        },
    ));
    let mut registry = HandlerRegistry::new();
    for (i, handler) in handlers.into_iter().enumerate() {
        router.register(
            CapabilityDescriptor::new(handler.name(), MockEmbedder::centroid(i), 10)
                .with_tools(handler.list_tools()),
        );
        registry.register(handler);
    }

    let executor = AgentExecutor::new(
        Arc::new(RateLimiter::new(LimiterConfig {
            capacity: 100.0,
            refill_per_sec: 100.0,
            max_wait: Duration::from_secs(1),
            max_waiters: 16,
        })),
        Duration::from_secs(30),
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
    );

    Arc::new(Orchestrator::new(
        router,
        Arc::new(registry),
        Arc::new(executor),
        planner,
        Arc::new(InMemoryTurnStore::new()),
        OrchestratorConfig {
            max_iterations,
            max_concurrent_tools: 4,
        },
    ))
}

#[tokio::test]
async fn test_tool_call_then_respond_flow() {
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::ToolCalls(vec![call("list_events")]),
        PlannerDecision::Respond("You have one event: Team sync.".to_string()),
    ]));
    let orchestrator = build(vec![Arc::new(DemoHandler::calendar())], planner, 8);

    let turn = orchestrator
        .handle_message("s1", "what's on my calendar tomorrow?")
        .await
        .unwrap();
    assert_eq!(turn.role, Role::Assistant);
    assert!(turn.content.contains("Team sync"));
    assert_eq!(orchestrator.phase("s1"), TurnPhase::Idle);

    // 历史：user → tool → assistant
    let history = orchestrator.history("s1").await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Tool);
    assert_eq!(history[1].tool_calls.len(), 1);
    assert!(history[1].tool_calls[0].succeeded());
    assert_eq!(history[2].role, Role::Assistant);
}

#[tokio::test]
async fn test_direct_respond_without_tools() {
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::Respond("Hello!".to_string()),
    ]));
    let orchestrator = build(vec![Arc::new(DemoHandler::calendar())], planner, 8);

    let turn = orchestrator.handle_message("s1", "hi").await.unwrap();
    assert_eq!(turn.content, "Hello!");
    assert!(!turn.degraded);

    let history = orchestrator.history("s1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|t| t.role != Role::Tool));
}

#[tokio::test]
async fn test_permanent_failure_fed_back_for_rerouting() {
    // 首次永久失败不终结回合：失败结果回灌，决策器换路
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::ToolCalls(vec![call("send_mail")]),
        PlannerDecision::Respond("I couldn't send the mail, your token expired.".to_string()),
    ]));
    let orchestrator = build(vec![Arc::new(AuthFailHandler)], planner, 8);

    let turn = orchestrator
        .handle_message("s1", "send the mail")
        .await
        .unwrap();
    assert!(turn.content.contains("token expired"));

    let history = orchestrator.history("s1").await.unwrap();
    let tool_turn = &history[1];
    assert_eq!(tool_turn.role, Role::Tool);
    assert!(!tool_turn.tool_calls[0].succeeded());
    // 永久失败只试一次
    assert_eq!(tool_turn.tool_calls[0].attempts, 1);
}

#[tokio::test]
async fn test_repeated_permanent_failure_ends_turn() {
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::ToolCalls(vec![call("send_mail")]),
        PlannerDecision::ToolCalls(vec![call("send_mail")]),
        PlannerDecision::Respond("unreachable".to_string()),
    ]));
    let orchestrator = build(vec![Arc::new(AuthFailHandler)], planner, 8);

    let turn = orchestrator
        .handle_message("s1", "send the mail")
        .await
        .unwrap();
    // 回合以失败说明收尾，而不是无限换路
    assert!(turn.content.contains("couldn't complete"));
    assert!(turn.content.contains("twice"));
    assert_eq!(orchestrator.phase("s1"), TurnPhase::Idle);

    // 会话仍可用
    let planner_done = orchestrator.handle_message("s1", "hello again").await;
    assert!(planner_done.is_ok());
}

#[tokio::test]
async fn test_loop_bound_degrades_response() {
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::ToolCalls(vec![call("list_events")]),
        PlannerDecision::ToolCalls(vec![call("list_events")]),
        PlannerDecision::ToolCalls(vec![call("list_events")]),
    ]));
    let orchestrator = build(vec![Arc::new(DemoHandler::calendar())], planner, 3);

    let turn = orchestrator
        .handle_message("s1", "keep checking my calendar")
        .await
        .unwrap();
    // 降级回答带机器可读标记，不只靠文案判断
    assert!(turn.degraded);
    assert!(turn.content.contains("wasn't able to fully complete"));
    assert_eq!(orchestrator.phase("s1"), TurnPhase::Idle);

    // 三轮工具调用都已执行并落盘
    let history = orchestrator.history("s1").await.unwrap();
    let tool_turns = history.iter().filter(|t| t.role == Role::Tool).count();
    assert_eq!(tool_turns, 3);
}

#[tokio::test]
async fn test_same_session_messages_processed_fifo() {
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::Respond("first reply".to_string()),
        PlannerDecision::Respond("second reply".to_string()),
    ]));
    let orchestrator = build(vec![Arc::new(DemoHandler::calendar())], planner, 8);

    let o1 = orchestrator.clone();
    let first = tokio::spawn(async move { o1.handle_message("s1", "first").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let o2 = orchestrator.clone();
    let second = tokio::spawn(async move { o2.handle_message("s1", "second").await });

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.content, "first reply");
    assert_eq!(second.content, "second reply");

    let history = orchestrator.history("s1").await.unwrap();
    let contents: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["first", "first reply", "second", "second reply"]
    );
}

#[tokio::test]
async fn test_cross_handler_calls_run_concurrently() {
    let a = Arc::new(SlowHandler::new("alpha", Duration::from_millis(100)));
    let b = Arc::new(SlowHandler::new("beta", Duration::from_millis(100)));
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::ToolCalls(vec![call_on("alpha", "work"), call_on("beta", "work")]),
        PlannerDecision::Respond("done".to_string()),
    ]));
    let orchestrator = build(vec![a.clone(), b.clone()], planner, 8);

    let start = Instant::now();
    orchestrator.handle_message("s1", "do both").await.unwrap();
    // 两个端点并行执行，总耗时明显小于串行的 200ms
    assert!(start.elapsed() < Duration::from_millis(190));
}

#[tokio::test]
async fn test_same_handler_calls_are_serialized() {
    let a = Arc::new(SlowHandler::new("alpha", Duration::from_millis(80)));
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::ToolCalls(vec![call_on("alpha", "work"), call_on("alpha", "work")]),
        PlannerDecision::Respond("done".to_string()),
    ]));
    let orchestrator = build(vec![a.clone()], planner, 8);

    let start = Instant::now();
    orchestrator.handle_message("s1", "do twice").await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(160));
    // 同端点从未并发
    assert_eq!(a.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_interrupts_turn() {
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::ToolCalls(vec![call_on("alpha", "work")]),
        PlannerDecision::Respond("unreachable".to_string()),
    ]));
    let slow = Arc::new(SlowHandler::new("alpha", Duration::from_secs(10)));
    let orchestrator = build(vec![slow], planner, 8);

    let o = orchestrator.clone();
    let task = tokio::spawn(async move { o.handle_message("s1", "slow work please").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel("s1");

    let result = task.await.unwrap();
    assert!(matches!(result, Err(AgentError::Cancelled)));
    assert_eq!(orchestrator.phase("s1"), TurnPhase::Idle);

    let history = orchestrator.history("s1").await.unwrap();
    assert_eq!(history.last().unwrap().content, "(cancelled)");
}

#[tokio::test]
async fn test_unknown_handler_reported_in_results() {
    let planner = Arc::new(ant::core::ScriptedPlanner::new(vec![
        PlannerDecision::ToolCalls(vec![call_on("ghost", "vanish")]),
        PlannerDecision::Respond("no such capability".to_string()),
    ]));
    let orchestrator = build(vec![Arc::new(DemoHandler::calendar())], planner, 8);

    let turn = orchestrator
        .handle_message("s1", "talk to a ghost")
        .await
        .unwrap();
    assert_eq!(turn.content, "no such capability");

    let history = orchestrator.history("s1").await.unwrap();
    let tool_turn = &history[1];
    assert!(!tool_turn.tool_calls[0].succeeded());
    assert!(tool_turn.content.contains("Unknown tool"));
}
