use std::{fmt, io};

use futures::future::BoxFuture;
use tracing::trace;

use crate::{
    contract::CallContext,
    error::BridgeError,
    pump::{
        state::{LoopHandle, LoopState, ResumeHandle},
        strategy::ByteSink,
    },
};

/// 写排他适配器：每次写入（以及刷新）前暂停接收循环，结束后恢复。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 某些加密流实现禁止读写并发，发送方向必须在写入期间保证共享流上没有挂起读取；
/// - 暂停/恢复句柄是两个循环之间唯一的同步原语，本适配器只是它的一个使用者。
///
/// ## 逻辑（How）
/// - 暂停接收循环拿到 [`ResumeHandle`]，写入完成、失败或 Future 被丢弃时句柄随作用域释放，
///   接收循环随即恢复；
/// - 接收循环已经 `Paused`/`Stopping`/`Stopped` 时没有读取在途，直接写入；
/// - 接收循环处于 `Pausing`（其他暂停者正在进行）或尚未启动时，等待其状态落定后重试。
///
/// ## 契约（What）
/// - 适配器不改变 sink 的写入语义，只在其前后加上排他区间；
/// - 暂停等待受 `ctx` 约束，`ctx` 通常绑定连接级取消令牌。
pub struct ExclusiveSink<K> {
    inner: K,
    receiver: LoopHandle,
    ctx: CallContext,
}

impl<K: ByteSink> ExclusiveSink<K> {
    pub fn new(inner: K, receiver: LoopHandle, ctx: CallContext) -> Self {
        Self {
            inner,
            receiver,
            ctx,
        }
    }
}

impl<K: ByteSink> ByteSink for ExclusiveSink<K> {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let _resume = quiesce(&self.receiver, &self.ctx).await?;
            self.inner.write(data).await
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let _resume = quiesce(&self.receiver, &self.ctx).await?;
            self.inner.flush().await
        })
    }
}

impl<K> fmt::Debug for ExclusiveSink<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveSink")
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}

/// 让接收循环进入“无读取在途”的状态；返回的凭据在作用域结束时恢复接收循环。
async fn quiesce(receiver: &LoopHandle, ctx: &CallContext) -> io::Result<Option<ResumeHandle>> {
    loop {
        match receiver.pause(ctx).await {
            Ok(resume) => return Ok(Some(resume)),
            Err(err) => match err.loop_state() {
                Some(LoopState::Pausing | LoopState::NotStarted) => {
                    receiver
                        .wait_for_state(ctx, |state| {
                            !matches!(state, LoopState::Pausing | LoopState::NotStarted)
                        })
                        .await
                        .map_err(into_io)?;
                }
                Some(state) => {
                    trace!(receiver = %state, "receiver idle; writing without exclusion");
                    return Ok(None);
                }
                None => return Err(into_io(err)),
            },
        }
    }
}

fn into_io(err: BridgeError) -> io::Error {
    io::Error::other(err)
}

/// 发送方向的 sink：按构造时的能力判定选择普通写入或写排他写入。
pub enum TransmitSink<K> {
    Plain(K),
    Exclusive(ExclusiveSink<K>),
}

impl<K: ByteSink> TransmitSink<K> {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, TransmitSink::Exclusive(_))
    }
}

impl<K: ByteSink> ByteSink for TransmitSink<K> {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        match self {
            TransmitSink::Plain(sink) => sink.write(data),
            TransmitSink::Exclusive(sink) => sink.write(data),
        }
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        match self {
            TransmitSink::Plain(sink) => sink.flush(),
            TransmitSink::Exclusive(sink) => sink.flush(),
        }
    }
}

impl<K> fmt::Debug for TransmitSink<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitSink::Plain(_) => f.write_str("TransmitSink::Plain"),
            TransmitSink::Exclusive(sink) => fmt::Debug::fmt(sink, f),
        }
    }
}
