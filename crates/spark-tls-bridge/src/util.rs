use std::future::Future;

use tokio::time::Instant as TokioInstant;

use crate::{
    contract::CallContext,
    error::{BridgeError, OperationKind},
};

/// 桥接层辅助工具：把 [`CallContext`] 的取消/截止语义落实到任意异步操作上。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手、关闭、暂停等待与停止等待都需要“调用方可放弃”的语义，集中实现避免到处手写 `tokio::select!`；
///
/// ## 逻辑（How）
/// - 先做一次同步检查：已过期或已取消时直接返回，不再创建等待；
/// - 之后以 `biased` 的 `select!` 同时等待取消、截止与目标 Future，取消优先；
/// - 取消通过 `Cancellation::cancelled` 的通知唤醒，不依赖轮询。
///
/// ## 契约（What）
/// - 目标 Future 自行决定成功值与错误类型，这里只把取消/超时映射为 [`BridgeError`]；
/// - 被取消或超时时目标 Future 会被丢弃，调用方需保证其可安全丢弃。
pub(crate) async fn run_with_context<F, T>(
    ctx: &CallContext,
    kind: OperationKind,
    future: F,
) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    if ctx.deadline().is_expired() {
        return Err(BridgeError::timeout(kind));
    }
    if ctx.cancellation().is_cancelled() {
        return Err(BridgeError::cancelled(kind));
    }

    let cancel = ctx.cancellation().cancelled();
    tokio::pin!(cancel);
    tokio::pin!(future);

    if let Some(deadline) = ctx.deadline().instant() {
        let sleep = tokio::time::sleep_until(TokioInstant::from_std(deadline));
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancel => Err(BridgeError::cancelled(kind)),
            _ = &mut sleep => Err(BridgeError::timeout(kind)),
            result = &mut future => result,
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancel => Err(BridgeError::cancelled(kind)),
            result = &mut future => result,
        }
    }
}
