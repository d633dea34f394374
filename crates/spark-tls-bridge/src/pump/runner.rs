use std::{fmt, io, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Instrument, debug, warn};

use crate::{
    contract::{CallContext, Cancellation},
    error::{BridgeError, Direction, LOOP_START, LOOP_STOP, is_read_cancelled},
    pump::{
        hooks::{CloseHook, LoopHooks},
        state::{LoopControl, LoopHandle, LoopState, ResumeHandle},
        strategy::{ByteSink, ByteSource},
    },
    util::run_with_context,
};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// 可暂停的单向字节搬运循环。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 桥接器的两个方向只在 source、sink 与两个钩子上不同，循环本身以组合方式接收这些策略，
///   而不是为每个方向派生一个子类型；
/// - 暂停必须能够打断一个可能永远不会完成的读取，同时不能丢失任何已经读出的字节。
///
/// ## 逻辑（How）
/// - `start` 把状态切到 `Running` 并在 Tokio 运行时上派生循环任务；
/// - 循环体在每轮读取前经过检查点：`Pausing`/`Paused` 时停靠并把状态落定为 `Paused`，
///   进入停止流程或任一取消令牌触发时退出；
/// - 提供了 `on_pause` 钩子时，读取 Future 从不被丢弃：循环在挂起读取期间观察到暂停或停止，
///   由循环任务自己调用钩子打断读取，读取以 `Interrupted` 完成后回到检查点；
///   写入阶段的暂停不会触发钩子。没有钩子时直接丢弃挂起读取；
/// - 已读出的数据在写入阶段按偏移推进，写入期间的暂停会丢弃挂起写入并停靠，恢复后从原偏移继续，
///   因此单方向内字节严格按读取顺序交付。
///
/// ## 契约（What）
/// - `stop` 返回时循环任务已经退出、`on_close` 已执行、状态为 `Stopped`；
///   对 `Stopped` 或 `NotStarted` 的循环调用是空操作；
/// - 稳态 I/O 失败只通过 `on_close` 上报，不会越过循环边界。
pub struct PausableLoop<S, K> {
    control: Arc<LoopControl>,
    parts: Mutex<Option<LoopParts<S, K>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    connection: Cancellation,
    buffer_size: usize,
}

struct LoopParts<S, K> {
    source: S,
    sink: K,
    on_close: Option<CloseHook>,
}

impl<S, K> PausableLoop<S, K>
where
    S: ByteSource,
    K: ByteSink,
{
    pub fn new(direction: Direction, source: S, sink: K, hooks: LoopHooks) -> Self {
        let LoopHooks { on_pause, on_close } = hooks;
        Self {
            control: LoopControl::new(direction, on_pause),
            parts: Mutex::new(Some(LoopParts {
                source,
                sink,
                on_close,
            })),
            task: Mutex::new(None),
            connection: Cancellation::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// 绑定连接级取消令牌；令牌触发时循环独立于任何调用上下文退出。
    pub fn with_connection_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.connection = cancellation;
        self
    }

    /// 单次读取的缓冲区大小，最小为 1。
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn direction(&self) -> Direction {
        self.control.direction()
    }

    pub fn state(&self) -> LoopState {
        self.control.current()
    }

    /// 暂停/恢复能力句柄。
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(Arc::clone(&self.control))
    }

    /// 等价于 `self.handle().pause(ctx)`。
    pub async fn pause(&self, ctx: &CallContext) -> Result<ResumeHandle, BridgeError> {
        self.handle().pause(ctx).await
    }

    /// 启动循环：`NotStarted → Running`，并派生循环任务。
    ///
    /// 返回时任务已被调度，调用方可以立即查询状态或暂停。`ctx` 的取消令牌在整个循环生命周期内有效。
    pub async fn start(&self, ctx: &CallContext) -> Result<(), BridgeError> {
        if ctx.cancellation().is_cancelled() {
            return Err(BridgeError::cancelled(LOOP_START));
        }

        // 持有任务槽直到任务句柄写入，避免并发 `stop` 观察到“已运行但无任务”的窗口。
        let mut task_slot = self.task.lock();
        let Some(parts) = self.parts.lock().take() else {
            return Err(BridgeError::invalid_state("start", self.state()));
        };
        if let Err(state) = self
            .control
            .transition(|state| state == LoopState::NotStarted, LoopState::Running)
        {
            return Err(BridgeError::invalid_state("start", state));
        }

        let runner = LoopRunner {
            control: Arc::clone(&self.control),
            connection: self.connection.clone(),
            call: ctx.cancellation().clone(),
            buffer_size: self.buffer_size,
        };
        let span = tracing::debug_span!("tls_bridge_loop", direction = %self.direction());
        *task_slot = Some(tokio::spawn(runner.run(parts).instrument(span)));
        debug!(direction = %self.direction(), "loop started");
        Ok(())
    }

    /// 停止循环并等待任务退出。
    pub async fn stop(&self, ctx: &CallContext) -> Result<(), BridgeError> {
        match self.control.transition(
            |state| matches!(state, LoopState::Running | LoopState::Pausing | LoopState::Paused),
            LoopState::Stopping,
        ) {
            Ok(previous) => debug!(direction = %self.direction(), ?previous, "loop stopping"),
            Err(LoopState::NotStarted) => return Ok(()),
            Err(_) => {}
        }

        let task = self.task.lock().take();
        let Some(task) = task else {
            // 另一次 `stop` 已取走任务句柄，等待其落定即可。
            self.handle()
                .wait_for_state(ctx, |state| state == LoopState::Stopped)
                .await?;
            return Ok(());
        };

        let direction = self.direction();
        let joined = run_with_context(ctx, LOOP_STOP, async move {
            task.await.map_err(|err| BridgeError::TaskFailed {
                direction,
                detail: err.to_string(),
            })
        })
        .await;
        if let Err(BridgeError::TaskFailed { detail, .. }) = &joined {
            warn!(direction = %direction, detail = %detail, "loop task failed");
            self.control.settle(LoopState::Stopped);
        }
        joined
    }
}

impl<S, K> fmt::Debug for PausableLoop<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PausableLoop")
            .field("control", &self.control)
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

enum Interruption {
    Pause,
    Halt,
}

/// 循环任务本体。
struct LoopRunner {
    control: Arc<LoopControl>,
    connection: Cancellation,
    call: Cancellation,
    buffer_size: usize,
}

impl LoopRunner {
    async fn run<S: ByteSource, K: ByteSink>(self, parts: LoopParts<S, K>) {
        let LoopParts {
            mut source,
            mut sink,
            on_close,
        } = parts;
        let mut state = self.control.subscribe();
        let mut buf = vec![0u8; self.buffer_size];

        let failure = self
            .pump(&mut source, &mut sink, &mut buf, &mut state)
            .await
            .err();
        match &failure {
            Some(err) => warn!(error = %err, "loop terminated by i/o failure"),
            None => debug!("loop finished"),
        }
        if let Some(on_close) = on_close {
            on_close(failure.as_ref());
        }
        // 先释放 source/sink，再宣告 Stopped：等待者随后可以安全回收底层流。
        drop(source);
        drop(sink);
        self.control.settle(LoopState::Stopped);
    }

    async fn pump<S: ByteSource, K: ByteSink>(
        &self,
        source: &mut S,
        sink: &mut K,
        buf: &mut [u8],
        state: &mut watch::Receiver<LoopState>,
    ) -> io::Result<()> {
        let drop_reads_on_pause = !self.control.cancels_reads();
        loop {
            if !self.checkpoint(state).await {
                return Ok(());
            }

            let read = if drop_reads_on_pause {
                tokio::select! {
                    biased;
                    result = source.read(buf) => result,
                    interruption = self.interrupted(state, true) => match interruption {
                        Interruption::Pause => continue,
                        Interruption::Halt => return Ok(()),
                    },
                }
            } else {
                // 读取不会被丢弃：暂停与停止都借助钩子打断，再等它以 `Interrupted` 收尾。
                // 钩子只在本循环确有挂起读取时触发。
                let pending = source.read(buf);
                tokio::pin!(pending);
                tokio::select! {
                    biased;
                    result = &mut pending => result,
                    _ = self.interrupted(state, true) => {
                        self.control.interrupt_pending_read();
                        pending.await
                    }
                }
            };
            let n = match read {
                Ok(0) => {
                    debug!("source reached end of stream");
                    return Ok(());
                }
                Ok(n) => n,
                Err(err) if is_read_cancelled(&err) => continue,
                Err(err) => return Err(err),
            };

            if !self.deliver(sink, &buf[..n], state).await? {
                return Ok(());
            }
        }
    }

    /// 把一次读取的数据完整写入 sink 并刷新；返回 `false` 表示期间进入了停止流程。
    async fn deliver<K: ByteSink>(
        &self,
        sink: &mut K,
        data: &[u8],
        state: &mut watch::Receiver<LoopState>,
    ) -> io::Result<bool> {
        let mut offset = 0;
        while offset < data.len() {
            let written = tokio::select! {
                biased;
                result = sink.write(&data[offset..]) => result?,
                interruption = self.interrupted(state, true) => match interruption {
                    Interruption::Pause if self.park(state).await => continue,
                    _ => return Ok(false),
                },
            };
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "sink accepted no bytes",
                ));
            }
            offset += written;
        }

        loop {
            tokio::select! {
                biased;
                result = sink.flush() => {
                    result?;
                    return Ok(true);
                }
                interruption = self.interrupted(state, true) => match interruption {
                    Interruption::Pause if self.park(state).await => continue,
                    _ => return Ok(false),
                },
            }
        }
    }

    /// 读取前的检查点；返回 `false` 表示循环应当退出。
    async fn checkpoint(&self, state: &mut watch::Receiver<LoopState>) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let current = *state.borrow_and_update();
            if current.is_halting() {
                return false;
            }
            if !current.is_pausing() {
                return true;
            }
            if !self.park(state).await {
                return false;
            }
        }
    }

    /// 停靠直到恢复；返回 `false` 表示停靠期间进入了停止流程或被取消。
    ///
    /// 恢复与下一次暂停可能紧挨着发生，因此等待的是“离开 `Paused`”，而不是“离开暂停流程”：
    /// 看到新的 `Pausing` 时重新落定为 `Paused`，否则新的暂停者会一直等不到确认。
    async fn park(&self, state: &mut watch::Receiver<LoopState>) -> bool {
        loop {
            if self
                .control
                .transition(|state| state == LoopState::Pausing, LoopState::Paused)
                .is_ok()
            {
                debug!("loop paused");
            }
            let next = tokio::select! {
                result = state.wait_for(|state| *state != LoopState::Paused) => match result {
                    Ok(current) => *current,
                    Err(_) => LoopState::Stopped,
                },
                _ = self.connection.cancelled() => return false,
                _ = self.call.cancelled() => return false,
            };
            match next {
                LoopState::Running => return true,
                LoopState::Pausing => continue,
                _ => return false,
            }
        }
    }

    /// 等待停止信号（以及可选的暂停信号）。
    async fn interrupted(
        &self,
        state: &mut watch::Receiver<LoopState>,
        include_pause: bool,
    ) -> Interruption {
        tokio::select! {
            result = state.wait_for(|state| state.is_halting() || (include_pause && state.is_pausing())) => {
                match result.map(|state| *state) {
                    Ok(current) if current.is_pausing() => Interruption::Pause,
                    _ => Interruption::Halt,
                }
            }
            _ = self.connection.cancelled() => Interruption::Halt,
            _ = self.call.cancelled() => Interruption::Halt,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.connection.is_cancelled() || self.call.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        channel::DuplexChannel,
        pump::strategy::{ChannelSink, ChannelSource},
    };

    fn channel_loop(
        hooks: LoopHooks,
    ) -> (
        PausableLoop<ChannelSource, ChannelSink>,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (source_local, source_peer) = tokio::io::duplex(1024);
        let (sink_local, sink_peer) = tokio::io::duplex(1024);
        let source = DuplexChannel::from_stream(source_local);
        let sink = DuplexChannel::from_stream(sink_local);
        let pump = PausableLoop::new(
            Direction::Transmit,
            ChannelSource::new(Arc::clone(source.reader())),
            ChannelSink::new(Arc::clone(sink.writer())),
            hooks,
        );
        (pump, source_peer, sink_peer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn copies_bytes_in_order_and_stops() {
        let (pump, mut input, mut output) = channel_loop(LoopHooks::new());
        let ctx = CallContext::default();
        pump.start(&ctx).await.expect("start");

        input.write_all(b"hello ").await.expect("input");
        input.write_all(b"world").await.expect("input");
        let mut buf = [0u8; 11];
        output.read_exact(&mut buf).await.expect("output");
        assert_eq!(&buf, b"hello world");

        pump.stop(&ctx).await.expect("stop");
        assert_eq!(pump.state(), LoopState::Stopped);
        pump.stop(&ctx).await.expect("idempotent stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_before_start_is_noop_and_start_twice_is_rejected() {
        let (pump, _input, _output) = channel_loop(LoopHooks::new());
        let ctx = CallContext::default();
        pump.stop(&ctx).await.expect("noop stop");
        assert_eq!(pump.state(), LoopState::NotStarted);

        pump.start(&ctx).await.expect("start");
        let err = pump.start(&ctx).await.expect_err("second start");
        assert!(err.is_state_error());
        pump.stop(&ctx).await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_without_hook_holds_data_until_resume() {
        let (pump, mut input, mut output) = channel_loop(LoopHooks::new());
        let ctx = CallContext::default();
        pump.start(&ctx).await.expect("start");

        let resume = pump.pause(&ctx).await.expect("pause");
        assert_eq!(pump.state(), LoopState::Paused);
        input.write_all(b"held").await.expect("input");

        let mut buf = [0u8; 4];
        let early = tokio::time::timeout(Duration::from_millis(50), output.read(&mut buf)).await;
        assert!(early.is_err(), "paused loop must not deliver");

        resume.resume();
        output.read_exact(&mut buf).await.expect("delivered after resume");
        assert_eq!(&buf, b"held");
        pump.stop(&ctx).await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_during_write_stage_does_not_fire_hook() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (source_local, mut input) = tokio::io::duplex(1024);
        // 容量为 1：第二个字节会一直卡在写入阶段，直到对端读取。
        let (sink_local, mut output) = tokio::io::duplex(1);
        let source = DuplexChannel::from_stream(source_local);
        let sink = DuplexChannel::from_stream(sink_local);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let canceller = Arc::clone(source.reader());
        let pump = PausableLoop::new(
            Direction::Transmit,
            ChannelSource::new(Arc::clone(source.reader())),
            ChannelSink::new(Arc::clone(sink.writer())),
            LoopHooks::new().on_pause(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                canceller.cancel_pending_read();
            }),
        );
        let ctx = CallContext::default();
        pump.start(&ctx).await.expect("start");

        input.write_all(b"xy").await.expect("input");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resume = tokio::time::timeout(Duration::from_secs(1), pump.pause(&ctx))
            .await
            .expect("pause settles")
            .expect("pause");
        assert_eq!(fired.load(Ordering::SeqCst), 0, "no read was pending");
        drop(resume);

        let mut buf = [0u8; 2];
        output.read_exact(&mut buf).await.expect("output");
        assert_eq!(&buf, b"xy");
        pump.stop(&ctx).await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_hook_interrupts_pending_read() {
        let (source_local, mut input) = tokio::io::duplex(1024);
        let (sink_local, mut output) = tokio::io::duplex(1024);
        let source = DuplexChannel::from_stream(source_local);
        let sink = DuplexChannel::from_stream(sink_local);
        let canceller = Arc::clone(source.reader());
        let pump = PausableLoop::new(
            Direction::Receive,
            ChannelSource::new(Arc::clone(source.reader())),
            ChannelSink::new(Arc::clone(sink.writer())),
            LoopHooks::new().on_pause(move || canceller.cancel_pending_read()),
        );
        let ctx = CallContext::default();
        pump.start(&ctx).await.expect("start");

        let resume = tokio::time::timeout(Duration::from_secs(1), pump.pause(&ctx))
            .await
            .expect("pause settles")
            .expect("pause");
        input.write_all(b"late").await.expect("input");
        drop(resume);

        let mut buf = [0u8; 4];
        output.read_exact(&mut buf).await.expect("output");
        assert_eq!(&buf, b"late");
        pump.stop(&ctx).await.expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn source_eof_runs_close_hook_without_error() {
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        let (pump, input, _output) = channel_loop(LoopHooks::new().on_close(move |err| {
            let _ = closed_tx.send(err.map(|err| err.kind()));
        }));
        let ctx = CallContext::default();
        pump.start(&ctx).await.expect("start");
        drop(input);

        let reported = closed_rx.await.expect("close hook ran");
        assert_eq!(reported, None);
        pump.handle()
            .wait_for_state(&ctx, |state| state == LoopState::Stopped)
            .await
            .expect("stopped");
        assert!(logs_contain("source reached end of stream"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connection_cancellation_stops_loop() {
        let connection = Cancellation::new();
        let (pump, _input, _output) = channel_loop(LoopHooks::new());
        let pump = pump.with_connection_cancellation(connection.clone());
        let ctx = CallContext::default();
        pump.start(&ctx).await.expect("start");

        connection.cancel();
        let settled = pump
            .handle()
            .wait_for_state(
                &CallContext::default().with_timeout(Some(Duration::from_secs(1))),
                |state| state == LoopState::Stopped,
            )
            .await
            .expect("stopped after cancel");
        assert_eq!(settled, LoopState::Stopped);
        pump.stop(&ctx).await.expect("stop after self-termination");
    }
}
