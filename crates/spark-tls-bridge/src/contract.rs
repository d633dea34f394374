use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// 取消原语，统一表达桥接层内可中断操作的契约。
///
/// # 设计背景（Why）
/// - 桥接层同时存在“连接级”与“单次调用级”两种取消来源：前者在构造桥接器时注入并贯穿整个连接生命周期，
///   后者随 `start`/`stop`/`pause` 调用传入；两者都必须能够及时打断正在等待 I/O 的循环任务。
/// - 仅有原子位无法唤醒挂起的 Future，因此在原子位之外附带 [`Notify`]，让 `cancelled().await`
///   可以被立即唤醒，而无需轮询。
///
/// # 逻辑解析（How）
/// - `cancel` 在首次成功设置取消位时返回 `true`，并级联取消所有仍存活的子令牌；
/// - `child` 派生“单向联动”的子令牌：父令牌取消会传递到子令牌，子令牌取消不影响父令牌；
/// - `cancelled` 先登记等待者再检查取消位，避免“检查后、登记前”触发取消而丢失唤醒。
///
/// # 契约说明（What）
/// - **前置条件**：构造时无需额外参数，默认处于“未取消”状态；
/// - **后置条件**：一旦 `cancel` 成功，`is_cancelled` 全局可见，所有 `cancelled()` 等待者都会被唤醒。
///
/// # 设计取舍与风险（Trade-offs）
/// - 子令牌以 `Weak` 登记在父令牌上，父令牌不会延长子令牌寿命；已释放的子令牌在下一次派生时清理。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancellationState>>>,
}

impl CancellationState {
    fn cancel(&self) -> bool {
        let first = self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
            let children = std::mem::take(&mut *self.children.lock());
            for child in children.iter().filter_map(Weak::upgrade) {
                child.cancel();
            }
        }
        first
    }
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState::default()),
        }
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// 派生子令牌：父令牌取消时子令牌随之取消，反之不成立。
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self.inner.children.lock();
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // 登记后再检查，覆盖与 `cancel` 并发的窗口。
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// 等待令牌被取消。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// 截止原语，描述一次调用的最迟完成时间。
///
/// - `none()` 表示调用方未施加硬超时；
/// - 截止时间不会自动触发取消，由 [`run_with_context`](crate::util::run_with_context) 在等待时一并监听。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 创建未设置截止时间的实例。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 根据绝对时间点构造截止时间。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时间为基准加上 `timeout` 生成截止时间。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// 返回内部时间点。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 判断是否已经超时。
    pub fn is_expired(&self) -> bool {
        self.instant.is_some_and(|deadline| deadline <= Instant::now())
    }

    /// 取两个截止时间中更早的一个。
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.instant, other.instant) {
            (Some(a), Some(b)) => Deadline::at(a.min(b)),
            (Some(_), None) => self,
            _ => other,
        }
    }
}

/// 单次调用的上下文：取消 + 截止。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `start`/`stop`/`pause` 都是可能长时间等待的异步操作，需要统一的方式表达“调用方放弃等待”；
/// - 与连接级取消令牌解耦：调用级上下文只约束本次调用，不会终止整条桥接链路。
///
/// ## 契约（What）
/// - `cancellation`：调用级取消令牌；
/// - `deadline`：调用级截止时间；
/// - `with_timeout`：派生一个截止时间更紧的副本，取消令牌为原令牌的子令牌。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    inner: Arc<CallContextInner>,
}

#[derive(Debug, Default)]
struct CallContextInner {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    /// 创建上下文构建器。
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    /// 获取取消原语。
    pub fn cancellation(&self) -> &Cancellation {
        &self.inner.cancellation
    }

    /// 查询截止时间。
    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    /// 派生截止时间不晚于 `timeout` 的子上下文；`None` 时沿用原截止时间。
    pub fn with_timeout(&self, timeout: Option<Duration>) -> CallContext {
        let deadline = match timeout {
            Some(timeout) => self.inner.deadline.min(Deadline::after(timeout)),
            None => self.inner.deadline,
        };
        CallContext::builder()
            .with_cancellation(self.inner.cancellation.child())
            .with_deadline(deadline)
            .build()
    }
}

/// `CallContext` 构建器。
#[derive(Default)]
pub struct CallContextBuilder {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContextBuilder {
    /// 设置取消原语。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 设置截止时间。
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// 构建上下文。
    pub fn build(self) -> CallContext {
        CallContext {
            inner: Arc::new(CallContextInner {
                cancellation: self.cancellation,
                deadline: self.deadline,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_follows_parent_but_not_reverse() {
        let parent = Cancellation::new();
        let child = parent.child();
        let grandchild = child.child();

        assert!(grandchild.cancel());
        assert!(!parent.is_cancelled());
        assert!(!child.is_cancelled());

        assert!(parent.cancel());
        assert!(child.is_cancelled());
        assert!(!parent.cancel(), "second cancel must report false");

        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child wakes after parent cancel");
    }

    #[tokio::test]
    async fn child_of_cancelled_parent_is_cancelled() {
        let parent = Cancellation::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn deadline_min_prefers_earlier() {
        let near = Deadline::after(Duration::from_millis(10));
        let far = Deadline::after(Duration::from_secs(10));
        assert_eq!(near.min(far), near);
        assert_eq!(Deadline::none().min(far), far);
        assert!(!Deadline::none().is_expired());
    }
}
