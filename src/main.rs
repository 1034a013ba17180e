//! Ant 演示 REPL
//!
//! 用演示端点 + 配置指定的 LLM/嵌入后端跑完整编排链路。
//! 默认 provider 为 mock，无需 API Key 即可运行。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use ant::cache::CacheService;
use ant::core::{LlmPlanner, Orchestrator};
use ant::executor::AgentExecutor;
use ant::handlers::{CapabilityHandler, DemoHandler, HandlerRegistry};
use ant::limiter::RateLimiter;
use ant::llm::{
    EmbeddingClient, EmbeddingGateway, LlmClient, MockEmbedder, MockLlmClient, OpenAiClient,
    OpenAiEmbedder,
};
use ant::memory::InMemoryTurnStore;
use ant::router::{CapabilityDescriptor, Router};

/// 每个演示端点的代表性描述，用于计算路由质心
const CAPABILITY_PHRASES: &[(&str, &str)] = &[
    ("mail", "check email inbox unread messages send reply mail"),
    (
        "calendar",
        "calendar meeting schedule reschedule appointment event tomorrow",
    ),
    ("tasks", "task todo ticket backlog create task mark done"),
];

#[tokio::main]
async fn main() -> Result<()> {
    ant::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = ant::config::load_config(config_path)?;
    tracing::info!(app = %settings.app.name, provider = %settings.llm.provider, "starting");

    let (llm, embedder): (Arc<dyn LlmClient>, Arc<dyn EmbeddingClient>) =
        match settings.llm.provider.as_str() {
            "openai" => (
                Arc::new(OpenAiClient::new(
                    settings.llm.base_url.as_deref(),
                    &settings.llm.model,
                    None,
                )),
                Arc::new(OpenAiEmbedder::new(
                    settings.llm.base_url.as_deref(),
                    &settings.embedding.model,
                    None,
                )),
            ),
            _ => (Arc::new(MockLlmClient), Arc::new(MockEmbedder)),
        };

    let cache = Arc::new(CacheService::new(settings.cache_config()));
    let gateway = Arc::new(EmbeddingGateway::new(embedder, cache));
    let router = Arc::new(Router::new(gateway.clone(), settings.router_config()));

    let mut registry = HandlerRegistry::new();
    for handler in [
        DemoHandler::mail(),
        DemoHandler::calendar(),
        DemoHandler::tasks(),
    ] {
        let name = handler.name().to_string();
        let phrase = CAPABILITY_PHRASES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, p)| *p)
            .unwrap_or(name.as_str());
        let centroid = gateway.embed(phrase).await?;
        router.register(
            CapabilityDescriptor::new(&name, centroid, 10).with_tools(handler.list_tools()),
        );
        registry.register(Arc::new(handler));
    }

    let executor = AgentExecutor::new(
        Arc::new(RateLimiter::new(settings.limiter_config())),
        settings.call_timeout(),
        settings.retry_policy(),
    );
    let orchestrator = Orchestrator::new(
        router,
        Arc::new(registry),
        Arc::new(executor),
        Arc::new(LlmPlanner::new(llm)),
        Arc::new(InMemoryTurnStore::new()),
        settings.orchestrator_config(),
    );

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    stdout
        .write_all(b"ant> type a message, /history, or /quit\nant> ")
        .await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" => break,
            "/history" => {
                for turn in orchestrator.history("repl").await? {
                    stdout
                        .write_all(format!("[{:?}] {}\n", turn.role, turn.content).as_bytes())
                        .await?;
                }
            }
            _ => match orchestrator.handle_message("repl", line).await {
                Ok(turn) => {
                    stdout
                        .write_all(format!("{}\n", turn.content).as_bytes())
                        .await?;
                }
                Err(e) => {
                    stdout.write_all(format!("error: {e}\n").as_bytes()).await?;
                }
            },
        }
        stdout.write_all(b"ant> ").await?;
        stdout.flush().await?;
    }

    Ok(())
}
