//! 语义路由：按能力质心的余弦相似度选择端点
//!
//! 每个端点注册一个代表性质心向量；route(text) 取嵌入后与全部质心比相似度，
//! 取最大者。最大相似度低于置信阈值时改走默认端点并标记 fallback。
//! 相似度打平（浮点容差内）时按 priority 升序、再按注册顺序决胜。

use std::sync::{Arc, RwLock};

use crate::core::AgentError;
use crate::handlers::ToolSchema;
use crate::llm::EmbeddingGateway;

/// 打平判定的浮点容差
const SIMILARITY_EPSILON: f32 = 1e-6;

/// 能力描述：端点名、质心、优先级、工具 schema（启动时注册，此后只读）
#[derive(Clone, Debug)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub centroid: Vec<f32>,
    pub priority: u32,
    pub tools: Vec<ToolSchema>,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, centroid: Vec<f32>, priority: u32) -> Self {
        Self {
            name: name.into(),
            centroid,
            priority,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }
}

/// 一次路由决策（按请求产生，不跨回合持久化）
#[derive(Clone, Debug)]
pub struct RoutingDecision {
    pub query: String,
    pub embedding: Vec<f32>,
    pub handler: String,
    pub score: f32,
    /// 最大相似度低于阈值、改走默认端点时为 true（信息性，非错误）
    pub fallback: bool,
}

/// 路由参数
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// 置信阈值：最大相似度低于该值时走默认端点
    pub confidence_threshold: f32,
    /// 默认/兜底端点名
    pub default_handler: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.35,
            default_handler: "chat".to_string(),
        }
    }
}

struct Registered {
    descriptor: CapabilityDescriptor,
    /// 注册顺序，用于打平决胜
    seq: usize,
}

/// 语义路由器
pub struct Router {
    gateway: Arc<EmbeddingGateway>,
    entries: RwLock<Vec<Registered>>,
    config: RouterConfig,
}

impl Router {
    pub fn new(gateway: Arc<EmbeddingGateway>, config: RouterConfig) -> Self {
        Self {
            gateway,
            entries: RwLock::new(Vec::new()),
            config,
        }
    }

    /// 注册能力端点；同名重复注册为幂等（就地替换，保留原注册顺序）
    pub fn register(&self, descriptor: CapabilityDescriptor) {
        let mut entries = self.entries.write().expect("router lock poisoned");
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.descriptor.name == descriptor.name)
        {
            existing.descriptor = descriptor;
            return;
        }
        let seq = entries.len();
        tracing::debug!(handler = %descriptor.name, priority = descriptor.priority, "capability registered");
        entries.push(Registered { descriptor, seq });
    }

    /// 已注册端点的工具 schema；未注册（如默认端点未注册时）返回空
    pub fn tools_for(&self, handler: &str) -> Vec<ToolSchema> {
        self.entries
            .read()
            .expect("router lock poisoned")
            .iter()
            .find(|e| e.descriptor.name == handler)
            .map(|e| e.descriptor.tools.clone())
            .unwrap_or_default()
    }

    /// 路由：嵌入 → 全量余弦相似度 → 取最大（含阈值兜底与打平决胜）
    ///
    /// 给定已注册端点与固定嵌入，该函数是纯的。
    pub async fn route(&self, text: &str) -> Result<RoutingDecision, AgentError> {
        let embedding = self.gateway.embed(text).await?;

        let entries = self.entries.read().expect("router lock poisoned");
        let mut best: Option<(&Registered, f32)> = None;
        for entry in entries.iter() {
            let score = cosine_similarity(&embedding, &entry.descriptor.centroid);
            best = match best {
                None => Some((entry, score)),
                Some((cur, cur_score)) => {
                    if score > cur_score + SIMILARITY_EPSILON {
                        Some((entry, score))
                    } else if (score - cur_score).abs() <= SIMILARITY_EPSILON
                        && (entry.descriptor.priority, entry.seq)
                            < (cur.descriptor.priority, cur.seq)
                    {
                        Some((entry, score))
                    } else {
                        Some((cur, cur_score))
                    }
                }
            };
        }

        let decision = match best {
            Some((entry, score)) if score >= self.config.confidence_threshold => RoutingDecision {
                query: text.to_string(),
                embedding,
                handler: entry.descriptor.name.clone(),
                score,
                fallback: false,
            },
            other => RoutingDecision {
                query: text.to_string(),
                embedding,
                handler: self.config.default_handler.clone(),
                score: other.map(|(_, score)| score).unwrap_or(0.0),
                fallback: true,
            },
        };
        tracing::info!(
            handler = %decision.handler,
            score = decision.score,
            fallback = decision.fallback,
            "routed"
        );
        Ok(decision)
    }
}

/// 余弦相似度；维度不一致或零向量时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheService};
    use crate::llm::MockEmbedder;

    fn router(threshold: f32) -> Router {
        let gateway = EmbeddingGateway::new(
            Arc::new(MockEmbedder::default()),
            Arc::new(CacheService::new(CacheConfig::default())),
        );
        Router::new(
            Arc::new(gateway),
            RouterConfig {
                confidence_threshold: threshold,
                default_handler: "chat".to_string(),
            },
        )
    }

    fn register_domains(router: &Router) {
        router.register(CapabilityDescriptor::new("mail", MockEmbedder::centroid(0), 10));
        router.register(CapabilityDescriptor::new("calendar", MockEmbedder::centroid(1), 10));
        router.register(CapabilityDescriptor::new("repo", MockEmbedder::centroid(2), 10));
    }

    #[test]
    fn test_cosine_similarity_basics() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_route_picks_max_similarity() {
        let router = router(0.3);
        register_domains(&router);

        let decision = router
            .route("reschedule my meeting tomorrow at 3pm")
            .await
            .unwrap();
        assert_eq!(decision.handler, "calendar");
        assert!(!decision.fallback);
        assert!(decision.score > 0.3);
    }

    #[tokio::test]
    async fn test_route_is_deterministic() {
        let router = router(0.3);
        register_domains(&router);

        let a = router.route("merge the release branch").await.unwrap();
        let b = router.route("merge the release branch").await.unwrap();
        assert_eq!(a.handler, b.handler);
        assert_eq!(a.score, b.score);
        assert_eq!(a.handler, "repo");
    }

    #[tokio::test]
    async fn test_below_threshold_falls_back_to_default() {
        let router = router(0.9);
        register_domains(&router);

        let decision = router.route("what is the weather like").await.unwrap();
        assert_eq!(decision.handler, "chat");
        assert!(decision.fallback);
    }

    #[tokio::test]
    async fn test_tie_breaks_by_registration_order() {
        let router = router(0.1);
        // 两个端点共享同一个质心，优先级相同：先注册者胜出
        router.register(CapabilityDescriptor::new("first", MockEmbedder::centroid(0), 10));
        router.register(CapabilityDescriptor::new("second", MockEmbedder::centroid(0), 10));

        let decision = router.route("check my email inbox").await.unwrap();
        assert_eq!(decision.handler, "first");
    }

    #[tokio::test]
    async fn test_tie_breaks_by_priority_first() {
        let router = router(0.1);
        router.register(CapabilityDescriptor::new("low", MockEmbedder::centroid(0), 20));
        router.register(CapabilityDescriptor::new("high", MockEmbedder::centroid(0), 5));

        let decision = router.route("check my email inbox").await.unwrap();
        assert_eq!(decision.handler, "high");
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let router = router(0.1);
        router.register(CapabilityDescriptor::new("mail", MockEmbedder::centroid(0), 10));
        router.register(
            CapabilityDescriptor::new("mail", MockEmbedder::centroid(0), 10).with_tools(vec![
                crate::handlers::ToolSchema::new("send_mail", "Send an email"),
            ]),
        );

        assert_eq!(router.tools_for("mail").len(), 1);
        let decision = router.route("check my email inbox").await.unwrap();
        assert_eq!(decision.handler, "mail");
    }
}
