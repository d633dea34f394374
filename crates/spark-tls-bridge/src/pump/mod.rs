//! 可暂停的单向字节搬运循环及其策略。
//!
//! - [`PausableLoop`]：`start`/`stop`/`pause` 生命周期与循环任务本体；
//! - [`LoopHandle`] / [`ResumeHandle`]：对外暴露的暂停/恢复能力；
//! - [`ByteSource`] / [`ByteSink`] / [`LoopHooks`]：两个方向之间唯一不同的部分；
//! - [`ExclusiveSink`]：读写不可并发时发送方向使用的写排他适配器。

mod exclusive;
mod hooks;
mod runner;
mod state;
mod strategy;

pub use exclusive::{ExclusiveSink, TransmitSink};
pub use hooks::LoopHooks;
pub use runner::PausableLoop;
pub use state::{LoopHandle, LoopState, ResumeHandle};
pub use strategy::{ByteSink, ByteSource, ChannelSink, ChannelSource};
