use std::{fmt, io, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{Instrument, Span, debug, info, warn};

use crate::{
    channel::DuplexChannel,
    config::BridgeConfig,
    contract::{CallContext, Cancellation},
    error::{BridgeError, CLOSE, Direction, HANDSHAKE},
    pump::{
        ChannelSink, ChannelSource, ExclusiveSink, LoopHandle, LoopHooks, LoopState,
        PausableLoop, TransmitSink,
    },
    raw::{RawStream, ReadInterrupter},
    stream::{WrappedReader, WrappedStream, WrappedWriter},
    util::run_with_context,
    wrap::StreamWrapper,
};

type ReceiverLoop<W> = PausableLoop<WrappedReader<<W as StreamWrapper>::Stream>, ChannelSink>;
type TransmitterLoop<W> =
    PausableLoop<ChannelSource, TransmitSink<WrappedWriter<<W as StreamWrapper>::Stream>>>;

/// 一次成功 `start` 产生的会话：两个循环 + 共享的加密流。
struct BridgeSession<W: StreamWrapper> {
    transmitter: TransmitterLoop<W>,
    receiver: ReceiverLoop<W>,
    stream: WrappedStream<W::Stream>,
    exclusive: bool,
}

impl<W: StreamWrapper> BridgeSession<W> {
    /// 两个循环的任务都已退出（或从未启动），加密流的两半已归还。
    fn loops_exited(&self) -> bool {
        let exited = |state: LoopState| matches!(state, LoopState::Stopped | LoopState::NotStarted);
        exited(self.transmitter.state()) && exited(self.receiver.state())
    }
}

/// 一次 teardown 的结果。
enum Teardown {
    /// 循环已退出，关闭已执行；携带第一个错误。
    Finished(Result<(), BridgeError>),
    /// 等待循环退出被调用方截断，流尚未关闭。
    LoopsRunning(BridgeError),
}

/// TLS 升级桥接器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 在传输侧通道（socket 一侧）与应用侧通道之间透明地插入加密流，上层继续读写明文；
/// - 两个方向各由一个可暂停循环驱动，共享同一个加密流；其他子系统可以通过
///   [`sender`](Self::sender) / [`receiver`](Self::receiver) 暂停任一方向。
///
/// ## 逻辑（How）
/// - `start`：在传输通道上构造 [`RawStream`]，交给包裹服务握手，随后构造两个循环、登记会话，
///   先启动发送循环再启动接收循环；任一步失败都会回滚，不留下会话；
/// - `stop`：并发停止两个循环并等待二者退出，随后回收加密流并只关闭一次，最后清除会话；
/// - 发送方向是否写排他在构造会话时一次性决定：[`WriteExclusion`](crate::config::WriteExclusion)
///   为 `auto` 时取决于包裹服务的 `supports_concurrent_io`。
///
/// ## 契约（What）
/// - 同一时刻至多一个会话，会话存在时 `start` 返回 `SessionActive`；
/// - `stop` 幂等，无会话时为空操作；返回第一个遇到的错误（发送循环、接收循环、关闭），但会话总会被清除；
/// - 调用方的通道从不被桥接器关闭；
/// - 桥接器被丢弃时触发内部连接令牌，仍在运行的循环随之退出。
///
/// ## 风险与权衡（Trade-offs）
/// - `start`/`stop` 由一把异步互斥锁串行化，重叠调用会排队而不是并发执行。
pub struct TlsBridge<W: StreamWrapper> {
    wrapper: W,
    credential: W::Credential,
    transport: DuplexChannel,
    application: DuplexChannel,
    connection: Cancellation,
    config: BridgeConfig,
    span: Span,
    lifecycle: AsyncMutex<()>,
    session: Mutex<Option<Arc<BridgeSession<W>>>>,
}

impl<W: StreamWrapper> TlsBridge<W> {
    /// 创建构建器。
    pub fn builder(
        wrapper: W,
        credential: W::Credential,
        transport: DuplexChannel,
        application: DuplexChannel,
    ) -> TlsBridgeBuilder<W> {
        TlsBridgeBuilder {
            wrapper,
            credential,
            transport,
            application,
            connection: Cancellation::new(),
            config: BridgeConfig::default(),
            span: Span::none(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn wrapper(&self) -> &W {
        &self.wrapper
    }

    /// 是否存在活动会话。
    pub fn is_active(&self) -> bool {
        self.session.lock().is_some()
    }

    /// 发送方向（应用 → 传输）的暂停/恢复能力。
    pub fn sender(&self) -> Result<LoopHandle, BridgeError> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.transmitter.handle())
            .ok_or(BridgeError::SessionMissing { accessor: "sender" })
    }

    /// 接收方向（传输 → 应用）的暂停/恢复能力。
    pub fn receiver(&self) -> Result<LoopHandle, BridgeError> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.receiver.handle())
            .ok_or(BridgeError::SessionMissing {
                accessor: "receiver",
            })
    }

    /// 握手并启动两个方向的循环。
    ///
    /// 握手受 `handshake_timeout` 约束；`ctx` 的取消令牌在循环生命周期内持续有效。
    pub async fn start(&self, ctx: &CallContext) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;
        async {
            if self.is_active() {
                return Err(BridgeError::SessionActive);
            }

            let raw = RawStream::with_chunk_size(&self.transport, self.config.buffer_size);
            let interrupter = raw.interrupter();
            let handshake_ctx = ctx.with_timeout(self.config.handshake_timeout());
            let stream = run_with_context(
                &handshake_ctx,
                HANDSHAKE,
                self.wrapper
                    .wrap(raw, self.config.role, &self.credential, &handshake_ctx),
            )
            .await
            .inspect_err(|err| warn!(code = err.code(), error = %err, "tls handshake failed"))?;
            debug!(role = ?self.config.role, "tls handshake completed");

            let session = Arc::new(self.build_session(WrappedStream::new(stream), interrupter));
            *self.session.lock() = Some(Arc::clone(&session));

            let started = match session.transmitter.start(ctx).await {
                Ok(()) => session.receiver.start(ctx).await,
                Err(err) => Err(err),
            };
            if let Err(err) = started {
                warn!(code = err.code(), error = %err, "bridge loops failed to start; rolling back");
                // 回滚不受调用方取消影响，只受关闭超时约束；回滚错误已无法改变结果，以启动错误为准。
                let rollback_ctx = CallContext::default().with_timeout(self.config.close_timeout());
                let _ = self.teardown(&session, &rollback_ctx).await;
                self.session.lock().take();
                return Err(err);
            }

            info!(exclusive = session.exclusive, "tls bridge started");
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// 停止两个循环并关闭加密流。
    ///
    /// `ctx` 在循环退出前被取消或到期时返回相应错误且会话保留，稍后再次调用 `stop` 即可完成关闭。
    pub async fn stop(&self, ctx: &CallContext) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;
        async {
            let current = self.session.lock().clone();
            let Some(session) = current else {
                debug!("stop without an active session");
                return Ok(());
            };

            let result = match self.teardown(&session, ctx).await {
                Teardown::Finished(result) => {
                    self.session.lock().take();
                    result
                }
                Teardown::LoopsRunning(err) => {
                    warn!(
                        code = err.code(),
                        error = %err,
                        "bridge loops still running; session kept until a later stop"
                    );
                    return Err(err);
                }
            };
            match &result {
                Ok(()) => info!("tls bridge stopped"),
                Err(err) => warn!(code = err.code(), error = %err, "tls bridge stopped with error"),
            }
            result
        }
        .instrument(self.span.clone())
        .await
    }

    fn build_session(
        &self,
        stream: WrappedStream<W::Stream>,
        interrupter: ReadInterrupter,
    ) -> BridgeSession<W> {
        let buffer_size = self.config.buffer_size;

        // 加密流上的读取最终挂在传输通道上，打断那里的读取即可让解密读取完成。
        // 打断与读取完成可能相互错过，循环退出时撤销残留的取消，通道原样交还调用方。
        let disarm = interrupter.clone();
        let receiver = PausableLoop::new(
            Direction::Receive,
            stream.reader(),
            ChannelSink::new(Arc::clone(self.application.writer())),
            LoopHooks::new()
                .on_pause(move || interrupter.interrupt())
                .on_close(move |err| {
                    disarm.disarm();
                    log_loop_close(Direction::Receive, err);
                }),
        )
        .with_connection_cancellation(self.connection.clone())
        .with_buffer_size(buffer_size);

        let exclusive = self
            .config
            .write_exclusion
            .required(self.wrapper.supports_concurrent_io());
        let sink = if exclusive {
            let exclusion_ctx = CallContext::builder()
                .with_cancellation(self.connection.clone())
                .build();
            TransmitSink::Exclusive(ExclusiveSink::new(
                stream.writer(),
                receiver.handle(),
                exclusion_ctx,
            ))
        } else {
            TransmitSink::Plain(stream.writer())
        };

        let application_reader = Arc::clone(self.application.reader());
        let clear_reader = Arc::clone(self.application.reader());
        let transmitter = PausableLoop::new(
            Direction::Transmit,
            ChannelSource::new(Arc::clone(self.application.reader())),
            sink,
            LoopHooks::new()
                .on_pause(move || application_reader.cancel_pending_read())
                .on_close(move |err| {
                    clear_reader.clear_pending_cancel();
                    log_loop_close(Direction::Transmit, err);
                }),
        )
        .with_connection_cancellation(self.connection.clone())
        .with_buffer_size(buffer_size);

        BridgeSession {
            transmitter,
            receiver,
            stream,
            exclusive,
        }
    }

    /// 并发停止两个循环，再关闭加密流；按发送、接收、关闭的顺序返回第一个错误。
    ///
    /// `ctx` 只约束“等待循环退出”。两个循环都已退出时关闭必定执行一次，且只受 `close_timeout`
    /// 约束；若等待被 `ctx` 截断而循环仍在运行，则不关闭，返回 [`Teardown::LoopsRunning`]。
    async fn teardown(&self, session: &BridgeSession<W>, ctx: &CallContext) -> Teardown {
        let (transmitted, received) = tokio::join!(
            session.transmitter.stop(ctx),
            session.receiver.stop(ctx)
        );
        if let Err(err) = &transmitted {
            warn!(direction = %Direction::Transmit, error = %err, "loop stop failed");
        }
        if let Err(err) = &received {
            warn!(direction = %Direction::Receive, error = %err, "loop stop failed");
        }
        let stopped = transmitted.and(received);
        if !session.loops_exited() {
            return Teardown::LoopsRunning(stopped.err().unwrap_or_else(|| {
                BridgeError::invalid_state("stop", session.transmitter.state())
            }));
        }
        // 循环已退出：等待被截断的错误不再有意义。
        let stopped = stopped.or_else(|err| match err {
            BridgeError::Cancelled { .. } | BridgeError::Timeout { .. } => Ok(()),
            other => Err(other),
        });
        let closed = self.close_stream(session).await;
        Teardown::Finished(stopped.and(closed))
    }

    async fn close_stream(&self, session: &BridgeSession<W>) -> Result<(), BridgeError> {
        let close_ctx = CallContext::default().with_timeout(self.config.close_timeout());
        run_with_context(&close_ctx, CLOSE, async {
            let stream = session
                .stream
                .reunite()
                .await
                .ok_or_else(|| BridgeError::close("wrapped stream already reclaimed"))?;
            self.wrapper.close(stream, &close_ctx).await
        })
        .await
        .inspect(|_| debug!("wrapped stream closed"))
        .inspect_err(|err| warn!(code = err.code(), error = %err, "tls close failed"))
    }
}

impl<W: StreamWrapper> Drop for TlsBridge<W> {
    fn drop(&mut self) {
        self.connection.cancel();
    }
}

impl<W: StreamWrapper + fmt::Debug> fmt::Debug for TlsBridge<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBridge")
            .field("wrapper", &self.wrapper)
            .field("config", &self.config)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

fn log_loop_close(direction: Direction, err: Option<&io::Error>) {
    match err {
        Some(err) => {
            let err = BridgeError::StreamIo {
                direction,
                source: io::Error::new(err.kind(), err.to_string()),
            };
            warn!(code = err.code(), error = %err, "bridge loop closed on failure");
        }
        None => debug!(direction = %direction, "bridge loop closed"),
    }
}

/// [`TlsBridge`] 构建器。
pub struct TlsBridgeBuilder<W: StreamWrapper> {
    wrapper: W,
    credential: W::Credential,
    transport: DuplexChannel,
    application: DuplexChannel,
    connection: Cancellation,
    config: BridgeConfig,
    span: Span,
}

impl<W: StreamWrapper> TlsBridgeBuilder<W> {
    /// 连接级取消令牌；触发后两个循环独立于任何调用上下文退出。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.connection = cancellation;
        self
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// 桥接器事件所在的 span；缺省为 `Span::none()`。
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// 校验配置并构建桥接器。
    pub fn build(self) -> Result<TlsBridge<W>, BridgeError> {
        self.config.validate()?;
        Ok(TlsBridge {
            wrapper: self.wrapper,
            credential: self.credential,
            transport: self.transport,
            application: self.application,
            // 内部持有子令牌：丢弃桥接器只影响本桥接器的循环。
            connection: self.connection.child(),
            config: self.config,
            span: self.span,
            lifecycle: AsyncMutex::new(()),
            session: Mutex::new(None),
        })
    }
}

impl<W: StreamWrapper> fmt::Debug for TlsBridgeBuilder<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBridgeBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
