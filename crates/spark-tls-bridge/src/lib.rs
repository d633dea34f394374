#![doc = r#"
# spark-tls-bridge

## 设计动机（Why）
- **透明加密**：在传输侧通道（socket 一侧）与应用侧通道之间注入 TLS 加密流，上层协议继续读写明文字节；
- **可暂停**：两个方向各由一个可暂停循环驱动，其他子系统可以在不拆除链路的前提下暂停任一方向；
- **平台差异**：部分加密流实现禁止读写并发，发送方向可切换为“写排他”模式，在写入期间暂停接收方向。

## 核心契约（What）
- [`TlsBridge`]：`start` 握手并启动两个循环，`stop` 停止循环并只关闭一次加密流，
  [`sender`](TlsBridge::sender) / [`receiver`](TlsBridge::receiver) 暴露暂停/恢复能力；
- [`StreamWrapper`]：握手与关闭服务的契约，`spark-tls-bridge-rustls` 提供基于 `rustls` 的实现；
- [`PausableLoop`] / [`LoopHandle`] / [`ResumeHandle`]：单向字节搬运循环及其暂停协议；
- [`DuplexChannel`]：调用方持有的双向通道端点，支持取消挂起读取。

## 实现策略（How）
- 循环以组合方式注入 [`ByteSource`]、[`ByteSink`] 与 [`LoopHooks`]，两个方向只在这些策略上不同；
- 循环状态通过 `tokio::sync::watch` 广播，暂停/恢复/停止都是对状态的条件迁移；
- 取消与截止沿用 [`CallContext`] 契约，握手与关闭的超时由 [`BridgeConfig`] 给出。

## 风险与考量（Trade-offs）
- 暂停依赖“取消挂起读取”把读取打断为 `ErrorKind::Interrupted`，自定义通道实现必须遵守该契约；
- 写排他模式下每次写入都要经历一次暂停握手，吞吐低于并发模式，只应在必要时启用。
"#]

mod bridge;
mod channel;
mod config;
mod contract;
mod error;
pub mod pump;
mod raw;
mod stream;
#[cfg(any(test, feature = "test-util"))]
pub mod test_stubs;
mod util;
mod wrap;

pub use bridge::{TlsBridge, TlsBridgeBuilder};
pub use channel::{ChannelReader, ChannelWriter, DuplexChannel, StreamReader, StreamWriter};
pub use config::{BridgeConfig, WriteExclusion};
pub use contract::{CallContext, CallContextBuilder, Cancellation, Deadline};
pub use error::{BridgeError, Direction, OperationKind, is_read_cancelled, read_cancelled};
pub use pump::{
    ByteSink, ByteSource, ExclusiveSink, LoopHandle, LoopHooks, LoopState, PausableLoop,
    ResumeHandle,
};
pub use raw::{RawStream, ReadInterrupter};
pub use stream::{WrappedReader, WrappedStream, WrappedWriter};
pub use wrap::{StreamWrapper, TlsRole};
