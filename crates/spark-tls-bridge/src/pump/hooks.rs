use std::{fmt, io, sync::Arc};

pub(crate) type PauseHook = Arc<dyn Fn() + Send + Sync>;
pub(crate) type CloseHook = Box<dyn FnOnce(Option<&io::Error>) + Send>;

/// 循环的可注入策略：暂停时与结束时各执行什么。
///
/// - `on_pause`：循环在挂起读取期间观察到暂停或停止时，由循环任务调用，负责让该读取以 `Interrupted` 完成；
///   写入阶段的暂停不会调用它。提供该钩子即表示“读取会被钩子打断”，循环不再丢弃读取 Future；
///   未提供时循环退回到直接丢弃挂起读取，要求 source 的读取可以安全丢弃；
/// - `on_close`：循环任务退出前调用一次，参数为触发退出的 I/O 错误（正常停止或 EOF 时为 `None`）。
#[derive(Default)]
pub struct LoopHooks {
    pub(crate) on_pause: Option<PauseHook>,
    pub(crate) on_close: Option<CloseHook>,
}

impl LoopHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pause<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_pause = Some(Arc::new(hook));
        self
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Option<&io::Error>) + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for LoopHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHooks")
            .field("on_pause", &self.on_pause.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}
