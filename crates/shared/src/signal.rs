//! 合并型工作信号
//!
//! `WorkSignal` 保证每个调度键在任意时刻最多只有一个“已排队或执行中”的工作单元：
//! 触发方重复请求时被合并为一次，worker 处理完成后调用 `mark_completed` 才允许下一次入队。
//!
//! `PolicyPartitionedSignal` 在构造时固定一组调度键（如发送时间策略），
//! 每个键持有独立的 `WorkSignal`，不同键之间互不竞争。单键场景即只有一个键的退化情形。

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{NotifyError, Result};
use crate::observability::metrics;

// ---------------------------------------------------------------------------
// WorkSignal
// ---------------------------------------------------------------------------

/// 单键合并信号
///
/// 由一个“已排队或执行中”标志和一个容量为 1 的信箱组成。
/// 标志与信箱占用的一致性只由本结构维护，调用方无需也无法直接修改。
pub struct WorkSignal {
    pending: AtomicBool,
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl Default for WorkSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkSignal {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            pending: AtomicBool::new(false),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// 非阻塞地请求一次工作
    ///
    /// 仅当当前没有排队或执行中的信号时返回 `true` 并写入信箱；
    /// 并发调用下只有一个调用方能拿到 `true`。信箱写入失败时回滚标志并返回 `false`。
    pub fn try_enqueue(&self) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(e) => {
                // 信箱仍被上一个未消费的信号占用，不能留下“已标记但未排队”的状态
                self.pending.store(false, Ordering::Release);
                warn!(error = %e, "写入工作信号失败，已回滚排队标志");
                false
            }
        }
    }

    /// 等待并消费一个信号
    ///
    /// 入队早于等待时立即返回。取消时不消费信号，也不会留下任何标志。
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NotifyError::Cancelled),
            guard = self.rx.lock() => guard,
        };

        // recv 是取消安全的：被取消时信号仍留在信箱中
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NotifyError::Cancelled),
            msg = rx.recv() => match msg {
                Some(()) => Ok(()),
                None => Err(NotifyError::Internal("工作信号信箱已关闭".to_string())),
            },
        }
    }

    /// 释放“已排队或执行中”标志
    ///
    /// 幂等：没有执行中的工作时调用不产生任何效果。
    pub fn mark_completed(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// 当前是否有排队或执行中的工作
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// PolicyPartitionedSignal
// ---------------------------------------------------------------------------

/// 隐式全局键，用于只有一个调度键的场景
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GlobalKey;

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("global")
    }
}

/// 按调度键分区的合并信号
///
/// 键集合在构造时确定，之后映射本身只读；每个键的状态由各自的 `WorkSignal` 同步。
pub struct PolicyPartitionedSignal<K> {
    signals: HashMap<K, WorkSignal>,
}

impl<K> PolicyPartitionedSignal<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    /// 以完整的键集合构造
    pub fn new(keys: impl IntoIterator<Item = K>) -> Self {
        let signals = keys
            .into_iter()
            .map(|key| (key, WorkSignal::new()))
            .collect();
        Self { signals }
    }

    fn signal(&self, key: &K) -> Result<&WorkSignal> {
        self.signals
            .get(key)
            .ok_or_else(|| NotifyError::UnknownSchedulingKey {
                key: key.to_string(),
            })
    }

    /// 为指定键请求一次工作，语义同 [`WorkSignal::try_enqueue`]
    pub fn try_enqueue(&self, key: &K) -> Result<bool> {
        let accepted = self.signal(key)?.try_enqueue();
        metrics::record_signal_enqueue(&key.to_string(), accepted);
        debug!(key = %key, accepted, "工作信号入队");
        Ok(accepted)
    }

    /// 等待指定键的信号；未知键属于调用方契约违例
    pub async fn wait(&self, key: &K, cancel: &CancellationToken) -> Result<()> {
        self.signal(key)?.wait(cancel).await
    }

    /// 释放指定键的执行中标志
    pub fn mark_completed(&self, key: &K) -> Result<()> {
        self.signal(key)?.mark_completed();
        Ok(())
    }

    pub fn is_pending(&self, key: &K) -> Result<bool> {
        Ok(self.signal(key)?.is_pending())
    }

    /// 已注册的全部键
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.signals.keys()
    }
}

impl PolicyPartitionedSignal<GlobalKey> {
    /// 只有一个隐式全局键的信号
    pub fn single() -> Self {
        Self::new([GlobalKey])
    }
}
