//! 工具执行服务：限流 + 超时 + 瞬时错误重试
//!
//! 每次调用的生命周期：取令牌 → 带超时 invoke → 按错误分类决定重试。
//! 瞬时错误按指数退避（带抖动）重试到次数上限；永久错误不重试立即上浮；
//! 取消令牌在等待与退避期间都会被响应。调用结束时写一条 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ToolCall, ToolOutcome};
use crate::handlers::{CapabilityHandler, HandlerError};
use crate::limiter::RateLimiter;

/// 重试参数
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// 总尝试次数上限（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// 工具执行服务
pub struct AgentExecutor {
    limiter: Arc<RateLimiter>,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl AgentExecutor {
    pub fn new(limiter: Arc<RateLimiter>, call_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            limiter,
            call_timeout,
            retry,
        }
    }

    /// 执行一次工具调用，在 call 上记录尝试次数、耗时与结果
    pub async fn execute(
        &self,
        handler: Arc<dyn CapabilityHandler>,
        call: &mut ToolCall,
        cancel: &CancellationToken,
    ) -> Result<Value, AgentError> {
        let started = Instant::now();
        let result = self.execute_inner(handler, call, cancel).await;
        call.elapsed_ms = started.elapsed().as_millis() as u64;
        call.outcome = match &result {
            Ok(value) => ToolOutcome::Success(value.clone()),
            Err(e) => ToolOutcome::Failed(e.to_string()),
        };

        let audit = serde_json::json!({
            "handler": call.handler,
            "operation": call.operation,
            "attempts": call.attempts,
            "elapsed_ms": call.elapsed_ms,
            "ok": result.is_ok(),
            "error": result.as_ref().err().map(|e| e.to_string()),
        });
        tracing::info!(audit = %audit, "tool");

        result
    }

    async fn execute_inner(
        &self,
        handler: Arc<dyn CapabilityHandler>,
        call: &mut ToolCall,
        cancel: &CancellationToken,
    ) -> Result<Value, AgentError> {
        let mut delay = self.retry.base_delay;
        let mut last_err: Option<AgentError> = None;

        while call.attempts < self.retry.max_attempts {
            call.attempts += 1;
            match self.attempt(&handler, call, cancel).await {
                Ok(value) => return Ok(value),
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        handler = %call.handler,
                        operation = %call.operation,
                        attempt = call.attempts,
                        error = %e,
                        "tool call failed, will retry"
                    );
                    last_err = Some(e);
                    if call.attempts >= self.retry.max_attempts {
                        break;
                    }
                    let jitter_cap = (delay.as_millis() as u64 / 2).max(1);
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
                    tokio::select! {
                        _ = tokio::time::sleep(delay + jitter) => {}
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    }
                    delay = (delay * 2).min(self.retry.max_delay);
                }
                // 永久错误：不重试
                Err(e) => return Err(e),
            }
        }

        let cause = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(AgentError::ToolFailed {
            attempts: call.attempts,
            cause,
        })
    }

    /// 单次尝试：取令牌 → 带超时 invoke → 错误映射
    async fn attempt(
        &self,
        handler: &Arc<dyn CapabilityHandler>,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<Value, AgentError> {
        let _permit = tokio::select! {
            permit = self.limiter.acquire(&call.handler) => permit?,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        let invoke = handler.invoke(&call.operation, call.args.clone());
        let result = tokio::select! {
            result = tokio::time::timeout(self.call_timeout, invoke) => result,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        };

        match result {
            Err(_) => Err(AgentError::ToolTimeout(format!(
                "{}::{}",
                call.handler, call.operation
            ))),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Self::map_handler_error(e)),
        }
    }

    fn map_handler_error(e: HandlerError) -> AgentError {
        match e {
            HandlerError::Auth(msg) => AgentError::ToolAuthError(msg),
            HandlerError::InvalidArgs(msg) => AgentError::ToolInvalidArgs(msg),
            HandlerError::UnknownOperation(op) => AgentError::UnknownTool(op),
            HandlerError::Unavailable(msg) => AgentError::HandlerUnavailable(msg),
            HandlerError::RateLimited => {
                AgentError::HandlerUnavailable("rate limited by upstream".to_string())
            }
        }
    }
}
