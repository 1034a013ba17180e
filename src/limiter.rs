//! 限流器：按端点维护令牌桶
//!
//! 每个端点一个桶（固定容量 + 固定补充速率），所有调用方共享。
//! acquire 挂起直到拿到令牌或超过最大等待时间（RateLimitTimeout）；
//! 每个桶的等待队列有界，队满时新调用方立即得到 Backpressure。
//! 等待方被取消时通过 Drop 守卫释放队列槽位。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::AgentError;

/// 令牌桶参数
#[derive(Clone, Debug)]
pub struct LimiterConfig {
    /// 桶容量（突发上限）
    pub capacity: f64,
    /// 每秒补充的令牌数
    pub refill_per_sec: f64,
    /// acquire 的最大等待时间
    pub max_wait: Duration,
    /// 单个端点允许同时挂起的等待方数量
    pub max_waiters: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 5.0,
            refill_per_sec: 2.0,
            max_wait: Duration::from_secs(10),
            max_waiters: 32,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    waiters: usize,
}

impl Bucket {
    fn full(config: &LimiterConfig) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: Instant::now(),
            waiters: 0,
        }
    }

    fn refill(&mut self, config: &LimiterConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(config.capacity);
        self.last_refill = now;
    }
}

/// 获取到的许可（令牌消耗式，不归还）
#[derive(Debug)]
pub struct Permit {
    pub handler: String,
}

/// 按端点名分桶的限流器
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    config: LimiterConfig,
}

/// 等待队列槽位守卫：等待方退出（成功、超时或被取消）时释放槽位
struct WaiterGuard<'a> {
    limiter: &'a RateLimiter,
    handler: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        // 析构中不可再 panic：锁中毒时取内部值继续释放槽位
        let mut buckets = self
            .limiter
            .buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = buckets.get_mut(self.handler) {
            bucket.waiters = bucket.waiters.saturating_sub(1);
        }
    }
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// 非阻塞获取；无令牌时返回 None（Busy）
    pub fn try_acquire(&self, handler: &str) -> Option<Permit> {
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        let bucket = buckets
            .entry(handler.to_string())
            .or_insert_with(|| Bucket::full(&self.config));
        bucket.refill(&self.config);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Some(Permit {
                handler: handler.to_string(),
            })
        } else {
            None
        }
    }

    /// 阻塞获取：挂起直到拿到令牌或超过 max_wait
    ///
    /// 队列已满时立即返回 Backpressure，不入队。
    pub async fn acquire(&self, handler: &str) -> Result<Permit, AgentError> {
        // 快路径
        if let Some(permit) = self.try_acquire(handler) {
            return Ok(permit);
        }

        // 登记等待者（有界队列）
        {
            let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
            let bucket = buckets
                .entry(handler.to_string())
                .or_insert_with(|| Bucket::full(&self.config));
            bucket.refill(&self.config);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(Permit {
                    handler: handler.to_string(),
                });
            }
            if bucket.waiters >= self.config.max_waiters {
                tracing::warn!(handler, waiters = bucket.waiters, "limiter backpressure");
                return Err(AgentError::Backpressure(handler.to_string()));
            }
            bucket.waiters += 1;
        }
        let _guard = WaiterGuard {
            limiter: self,
            handler,
        };

        let deadline = Instant::now() + self.config.max_wait;
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
                let bucket = buckets
                    .get_mut(handler)
                    .expect("bucket registered above");
                bucket.refill(&self.config);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(Permit {
                        handler: handler.to_string(),
                    });
                }
                // 距下一枚令牌的时间；补充速率为 0（或极小）时只能等到截止
                let deficit = (1.0 - bucket.tokens).max(0.0);
                let secs = deficit / self.config.refill_per_sec;
                if secs.is_finite() && secs < self.config.max_wait.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    self.config.max_wait
                }
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(handler, "limiter wait timed out");
                return Err(AgentError::RateLimitTimeout(handler.to_string()));
            }
            let sleep_for = wait.min(deadline - now).max(Duration::from_millis(1));
            tokio::time::sleep(sleep_for).await;
        }
    }
}
