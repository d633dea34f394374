//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义桥接层对外暴露的错误语义：握手失败、状态违例、稳态 I/O 失败、关闭失败以及上下文取消/超时；
//! - 每个错误都携带稳定错误码（`spark.tls_bridge.*`），运维脚本与测试可按错误码断言，而无需解析文案。
//!
//! ## 传播策略（What）
//! - 握手失败沿 `start` 向调用方传播，且不会留下任何会话；
//! - 稳态 I/O 失败在循环边界被吸收，通过 on-close 钩子上报，只有在 `stop` 汇总时才可能再次出现；
//! - 关闭失败会被上报，但不会阻止会话被清理。

use std::{borrow::Cow, fmt, io};

use thiserror::Error;

use crate::pump::LoopState;

/// 描述一次桥接操作的错误码及默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.tls_bridge.handshake_failed",
    message: "tls handshake",
};

pub(crate) const CLOSE: OperationKind = OperationKind {
    code: "spark.tls_bridge.close_failed",
    message: "tls close",
};

pub(crate) const LOOP_START: OperationKind = OperationKind {
    code: "spark.tls_bridge.loop_start",
    message: "loop start",
};

pub(crate) const LOOP_STOP: OperationKind = OperationKind {
    code: "spark.tls_bridge.loop_stop",
    message: "loop stop",
};

pub(crate) const LOOP_WAIT: OperationKind = OperationKind {
    code: "spark.tls_bridge.loop_wait",
    message: "loop state wait",
};

/// 桥接方向，用于错误与日志中标注是哪一个循环。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 加密流 → 应用通道。
    Receive,
    /// 应用通道 → 加密流。
    Transmit,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Receive => "receiver",
            Direction::Transmit => "transmitter",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 桥接层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把握手服务、循环状态机与上下文治理的失败统一到一个枚举，`start`/`stop`/`pause`
///   都以它作为错误类型，调用方只需一次 `match` 即可决定重试、告警或放弃；
/// - **契约 (What)**：
///   - `Handshake`/`Close` 携带实现方提供的 `detail` 与可选 `source`，实现方可借此保留 `rustls` 等底层错误；
///   - `InvalidState` 描述“在错误状态下调用了循环操作”，属于编程错误而非可恢复故障；
///   - `SessionMissing`/`SessionActive` 描述会话访问器与重复启动违例；
/// - **设计权衡 (Trade-offs)**：`detail` 使用 `Cow<'static, str>`，常量文案零分配，动态文案才分配。
#[derive(Debug, Error)]
pub enum BridgeError {
    /// 握手失败，`start` 不会留下任何会话。
    #[error("tls handshake failed: {detail}")]
    Handshake {
        detail: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// 关闭加密流失败；桥接层仍视为已关闭。
    #[error("tls close failed: {detail}")]
    Close {
        detail: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// 在不允许的循环状态下执行了操作，例如暂停一个未运行的循环。
    #[error("{operation} rejected while loop is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LoopState,
    },

    /// 没有活动会话时访问 Sender/Receiver 能力。
    #[error("{accessor} is only available while a bridge session is active")]
    SessionMissing { accessor: &'static str },

    /// 已有活动会话时再次调用 `start`。
    #[error("bridge session already active; stop it before starting again")]
    SessionActive,

    /// 稳态读写失败。
    #[error("{direction} i/o failed: {source}")]
    StreamIo {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// 调用方取消了等待。
    #[error("{} cancelled", .operation.message)]
    Cancelled { operation: OperationKind },

    /// 调用方截止时间已到。
    #[error("{} timed out", .operation.message)]
    Timeout { operation: OperationKind },

    /// 循环任务异常终止（panic 或被运行时中止）。
    #[error("{direction} task failed: {detail}")]
    TaskFailed {
        direction: Direction,
        detail: String,
    },

    /// 配置无效。
    #[error("invalid bridge configuration: {detail}")]
    Config { detail: Cow<'static, str> },
}

impl BridgeError {
    /// 以文案构造握手错误。
    pub fn handshake(detail: impl Into<Cow<'static, str>>) -> Self {
        BridgeError::Handshake {
            detail: detail.into(),
            source: None,
        }
    }

    /// 以文案与底层错误构造握手错误。
    pub fn handshake_with_source<E>(detail: impl Into<Cow<'static, str>>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BridgeError::Handshake {
            detail: detail.into(),
            source: Some(Box::new(source)),
        }
    }

    /// 以文案构造关闭错误。
    pub fn close(detail: impl Into<Cow<'static, str>>) -> Self {
        BridgeError::Close {
            detail: detail.into(),
            source: None,
        }
    }

    /// 以文案与底层错误构造关闭错误。
    pub fn close_with_source<E>(detail: impl Into<Cow<'static, str>>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        BridgeError::Close {
            detail: detail.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, state: LoopState) -> Self {
        BridgeError::InvalidState { operation, state }
    }

    pub(crate) fn cancelled(operation: OperationKind) -> Self {
        BridgeError::Cancelled { operation }
    }

    pub(crate) fn timeout(operation: OperationKind) -> Self {
        BridgeError::Timeout { operation }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Handshake { .. } => HANDSHAKE.code,
            BridgeError::Close { .. } => CLOSE.code,
            BridgeError::InvalidState { .. } => "spark.tls_bridge.invalid_state",
            BridgeError::SessionMissing { .. } => "spark.tls_bridge.session_missing",
            BridgeError::SessionActive => "spark.tls_bridge.session_active",
            BridgeError::StreamIo { .. } => "spark.tls_bridge.stream_io",
            BridgeError::Cancelled { .. } => "spark.tls_bridge.cancelled",
            BridgeError::Timeout { .. } => "spark.tls_bridge.timeout",
            BridgeError::TaskFailed { .. } => "spark.tls_bridge.task_failed",
            BridgeError::Config { .. } => "spark.tls_bridge.invalid_config",
        }
    }

    /// 是否属于“状态违例”一类的编程错误。
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidState { .. }
                | BridgeError::SessionMissing { .. }
                | BridgeError::SessionActive
        )
    }

    /// 若为 `InvalidState`，返回被拒绝时的循环状态。
    pub fn loop_state(&self) -> Option<LoopState> {
        match self {
            BridgeError::InvalidState { state, .. } => Some(*state),
            _ => None,
        }
    }
}

/// 构造“挂起读取被取消”的 I/O 错误。
///
/// 使用 `Interrupted` 表示：读取本身没有失败，只是被暂停协议打断，调用方应当重新发起读取。
pub fn read_cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "pending read cancelled")
}

/// 判断 I/O 错误是否为暂停协议引发的读取取消。
pub fn is_read_cancelled(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::Interrupted
}
