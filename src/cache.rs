//! 缓存服务：single-flight 去重 + TTL + LRU 淘汰
//!
//! get_or_compute(key, compute)：已解析项直接命中；同 key 已有计算在途时挂接等待，
//! 不重复发起计算；失败结果也会缓存一个短暂的宽限期，避免惊群式重试。
//! 计算在独立任务中执行，单个等待方取消只是脱离等待，不会中断其它等待方共享的计算。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// 缓存参数：条目数上限、成功 TTL、失败宽限期
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// 已解析条目数上限，超过后按 LRU 淘汰
    pub capacity: usize,
    /// 成功结果的存活时间
    pub ttl: Duration,
    /// 失败结果的短暂缓存时间，到期后该 key 视为不存在
    pub failure_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Duration::from_secs(600),
            failure_grace: Duration::from_secs(5),
        }
    }
}

type Computed<V> = Result<V, String>;

enum Slot<V> {
    /// 已解析（成功或失败都算解析完成）
    Ready {
        value: Computed<V>,
        expires_at: Instant,
        last_access: Instant,
    },
    /// 计算在途，等待方挂接同一个 watch 通道
    InFlight {
        rx: watch::Receiver<Option<Computed<V>>>,
    },
}

struct Inner<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// 泛型记忆化缓存
pub struct CacheService<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheService<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Role<V> {
    /// 命中已解析项
    Hit(Computed<V>),
    /// 挂接在途计算
    Waiter(watch::Receiver<Option<Computed<V>>>),
    /// 本调用方负责发起计算
    Leader(watch::Sender<Option<Computed<V>>>),
}

impl<V: Clone + Send + Sync + 'static> CacheService<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                config,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// 命中与未命中计数（可观测性）
    pub fn stats(&self) -> (u64, u64) {
        (
            self.inner.hits.load(Ordering::Relaxed),
            self.inner.misses.load(Ordering::Relaxed),
        )
    }

    /// 当前已解析 + 在途的条目数
    pub fn len(&self) -> usize {
        self.inner.slots.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取已解析值，或发起/挂接一次计算
    ///
    /// compute 只在该 key 没有可用结果且没有在途计算时执行一次；
    /// 并发调用方拿到同一个值或同一个传播的失败。
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Computed<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Computed<V>> + Send + 'static,
    {
        let now = Instant::now();
        let role = {
            let mut slots = self.inner.slots.lock().expect("cache lock poisoned");
            match slots.get_mut(key) {
                Some(Slot::Ready {
                    value,
                    expires_at,
                    last_access,
                }) if *expires_at > now => {
                    *last_access = now;
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    Role::Hit(value.clone())
                }
                Some(Slot::InFlight { rx }) => Role::Waiter(rx.clone()),
                // 不存在或已过期：登记在途计算，本调用方为 leader
                _ => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.to_string(), Slot::InFlight { rx });
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Hit(value) => {
                tracing::debug!(key, "cache hit");
                value
            }
            Role::Waiter(rx) => {
                tracing::debug!(key, "cache wait (in-flight)");
                self.wait(key, rx).await
            }
            Role::Leader(tx) => {
                tracing::debug!(key, "cache miss, computing");
                // 计算放入独立任务：leader 被取消也不影响其它等待方
                let inner = self.inner.clone();
                let key_owned = key.to_string();
                let fut = compute();
                let mut rx = tx.subscribe();
                tokio::spawn(async move {
                    let result = fut.await;
                    inner.install(&key_owned, result.clone());
                    let _ = tx.send(Some(result));
                });
                self.wait_rx(&mut rx).await
            }
        }
    }

    /// 等待在途计算完成；通道中断时清理失效的在途槽位
    async fn wait(&self, key: &str, mut rx: watch::Receiver<Option<Computed<V>>>) -> Computed<V> {
        match self.wait_rx(&mut rx).await {
            Err(e) if e == ABORTED => {
                let mut slots = self.inner.slots.lock().expect("cache lock poisoned");
                if matches!(slots.get(key), Some(Slot::InFlight { rx }) if rx.has_changed().is_err())
                {
                    slots.remove(key);
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn wait_rx(&self, rx: &mut watch::Receiver<Option<Computed<V>>>) -> Computed<V> {
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            if rx.changed().await.is_err() {
                return Err(ABORTED.to_string());
            }
        }
    }
}

const ABORTED: &str = "cache computation aborted";

impl<V: Clone> Inner<V> {
    /// 将结果安装为已解析项（每个 key 的在途计算只安装一次），并按 LRU 淘汰超额项
    fn install(&self, key: &str, value: Computed<V>) {
        let now = Instant::now();
        let ttl = if value.is_ok() {
            self.config.ttl
        } else {
            self.config.failure_grace
        };
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        slots.insert(
            key.to_string(),
            Slot::Ready {
                value,
                expires_at: now + ttl,
                last_access: now,
            },
        );
        self.evict(&mut slots);
    }

    /// 只淘汰已解析项，在途计算不可丢弃
    fn evict(&self, slots: &mut HashMap<String, Slot<V>>) {
        loop {
            let ready_count = slots
                .values()
                .filter(|s| matches!(s, Slot::Ready { .. }))
                .count();
            if ready_count <= self.config.capacity {
                return;
            }
            let oldest = slots
                .iter()
                .filter_map(|(k, s)| match s {
                    Slot::Ready { last_access, .. } => Some((k.clone(), *last_access)),
                    Slot::InFlight { .. } => None,
                })
                .min_by_key(|(_, last_access)| *last_access)
                .map(|(k, _)| k);
            match oldest {
                Some(k) => {
                    tracing::debug!(key = %k, "cache evict (lru)");
                    slots.remove(&k);
                }
                None => return,
            }
        }
    }
}
