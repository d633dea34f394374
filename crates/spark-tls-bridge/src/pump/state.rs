use std::{fmt, sync::Arc};

use tokio::sync::watch;
use tracing::debug;

use crate::{
    contract::CallContext,
    error::{BridgeError, Direction, LOOP_WAIT},
    pump::hooks::PauseHook,
    util::run_with_context,
};

/// 单向循环的生命周期状态。
///
/// ```text
/// NotStarted ──start──▶ Running ──pause──▶ Pausing ──(循环停在检查点)──▶ Paused
///                          ▲                  │                           │
///                          └──────resume──────┴───────────resume──────────┘
/// Running/Pausing/Paused ──stop──▶ Stopping ──(任务退出)──▶ Stopped
/// ```
///
/// - `NotStarted` 为初始状态，`Stopped` 为终态；
/// - `Pausing`/`Paused` 只能从 `Running` 进入。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoopState {
    NotStarted,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
}

impl LoopState {
    /// 是否处于暂停流程（`Pausing` 或 `Paused`）。
    pub fn is_pausing(self) -> bool {
        matches!(self, LoopState::Pausing | LoopState::Paused)
    }

    /// 是否处于停止流程（`Stopping` 或 `Stopped`）。
    pub fn is_halting(self) -> bool {
        matches!(self, LoopState::Stopping | LoopState::Stopped)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 循环的共享控制块：状态广播 + 暂停钩子。
///
/// 状态保存在 `watch::Sender` 中：写方以 `send_if_modified` 做条件迁移，读方以 `wait_for`
/// 等待目标状态，二者都不需要额外的锁。
pub(crate) struct LoopControl {
    direction: Direction,
    state: watch::Sender<LoopState>,
    on_pause: Option<PauseHook>,
}

impl LoopControl {
    pub(crate) fn new(direction: Direction, on_pause: Option<PauseHook>) -> Arc<Self> {
        let (state, _) = watch::channel(LoopState::NotStarted);
        Arc::new(Self {
            direction,
            state,
            on_pause,
        })
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn current(&self) -> LoopState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// 暂停钩子是否负责打断挂起读取。
    pub(crate) fn cancels_reads(&self) -> bool {
        self.on_pause.is_some()
    }

    /// 条件迁移：当前状态满足 `allowed` 时切换到 `next` 并返回旧状态，否则返回当前状态。
    pub(crate) fn transition(
        &self,
        allowed: impl Fn(LoopState) -> bool,
        next: LoopState,
    ) -> Result<LoopState, LoopState> {
        let mut outcome = Err(next);
        self.state.send_if_modified(|state| {
            let previous = *state;
            if allowed(previous) {
                *state = next;
                outcome = Ok(previous);
                previous != next
            } else {
                outcome = Err(previous);
                false
            }
        });
        outcome
    }

    /// 无条件落定状态。
    pub(crate) fn settle(&self, next: LoopState) {
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    /// 调用暂停钩子打断 source 上的挂起读取。
    pub(crate) fn interrupt_pending_read(&self) {
        if let Some(hook) = &self.on_pause {
            hook();
        }
    }
}

impl fmt::Debug for LoopControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopControl")
            .field("direction", &self.direction)
            .field("state", &self.current())
            .field("cancels_reads", &self.cancels_reads())
            .finish()
    }
}

/// 循环的暂停/恢复能力句柄，即桥接器对外暴露的 *Sender* / *Receiver*。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 其他子系统（例如需要在明文通道上插入协议切换的上层）只需要“让某个方向暂时停下”的能力，
///   而不应接触循环本身的启动与停止；
/// - 句柄可克隆、可跨任务传递，写排他适配器也通过它暂停接收循环。
///
/// ## 契约（What）
/// - [`pause`](Self::pause)：`Running → Pausing → Paused`，返回 [`ResumeHandle`]；
///   非 `Running` 状态下调用返回 `InvalidState`，暂停不叠加；
/// - [`state`](Self::state) / [`wait_for_state`](Self::wait_for_state)：观察循环状态。
#[derive(Clone, Debug)]
pub struct LoopHandle {
    control: Arc<LoopControl>,
}

impl LoopHandle {
    pub(crate) fn new(control: Arc<LoopControl>) -> Self {
        Self { control }
    }

    pub fn direction(&self) -> Direction {
        self.control.direction()
    }

    /// 当前状态快照。
    pub fn state(&self) -> LoopState {
        self.control.current()
    }

    /// 等待状态满足 `reached`，受 `ctx` 的取消与截止约束；返回满足条件时的状态。
    pub async fn wait_for_state(
        &self,
        ctx: &CallContext,
        mut reached: impl FnMut(LoopState) -> bool + Send,
    ) -> Result<LoopState, BridgeError> {
        let mut state = self.control.subscribe();
        run_with_context(ctx, LOOP_WAIT, async move {
            match state.wait_for(|current| reached(*current)).await {
                Ok(current) => Ok(*current),
                // 控制块持有发送端，句柄存活期间不会关闭。
                Err(_) => Err(BridgeError::invalid_state("wait", LoopState::Stopped)),
            }
        })
        .await
    }

    /// 暂停循环。
    ///
    /// ## 逻辑（How）
    /// 1. `Running → Pausing`，失败则以当时的状态返回 `InvalidState`；
    /// 2. 循环若正挂起在读取上，会自行调用暂停钩子打断它；处于写入阶段时则在写入让出后停靠；
    /// 3. 等待循环在检查点把状态落定为 `Paused`；若期间循环进入停止流程，返回 `InvalidState`。
    ///
    /// 任一步失败都会丢弃已创建的 [`ResumeHandle`]，循环随即恢复运行。
    pub async fn pause(&self, ctx: &CallContext) -> Result<ResumeHandle, BridgeError> {
        if let Err(state) = self
            .control
            .transition(|state| state == LoopState::Running, LoopState::Pausing)
        {
            return Err(BridgeError::invalid_state("pause", state));
        }
        let resume = ResumeHandle {
            control: Arc::clone(&self.control),
        };
        debug!(direction = %self.direction(), "loop pausing");

        let settled = self
            .wait_for_state(ctx, |state| state != LoopState::Pausing)
            .await?;
        if settled == LoopState::Paused {
            Ok(resume)
        } else {
            Err(BridgeError::invalid_state("pause", settled))
        }
    }
}

/// 暂停凭据：调用 [`resume`](Self::resume) 或直接丢弃都会让循环回到 `Running`。
///
/// 若循环在暂停期间已进入停止流程，恢复是空操作。
#[must_use = "dropping a ResumeHandle resumes the loop immediately"]
#[derive(Debug)]
pub struct ResumeHandle {
    control: Arc<LoopControl>,
}

impl ResumeHandle {
    /// 显式恢复循环。
    pub fn resume(self) {}
}

impl Drop for ResumeHandle {
    fn drop(&mut self) {
        if self
            .control
            .transition(LoopState::is_pausing, LoopState::Running)
            .is_ok()
        {
            debug!(direction = %self.control.direction(), "loop resumed");
        }
    }
}
