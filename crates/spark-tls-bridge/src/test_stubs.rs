//! 集成测试与下游实现可复用的桩件。
//!
//! - [`PassthroughWrapper`]：不做加密、直接把裸流当作“加密流”的包裹服务，统计 wrap/close 调用次数；
//! - [`RejectingWrapper`]：握手总是失败的包裹服务；
//! - [`ExclusiveIoProbe`]：包装任意流，记录“读取挂起期间开始写入”的违例次数。

use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{
    contract::CallContext,
    error::BridgeError,
    raw::RawStream,
    wrap::{StreamWrapper, TlsRole},
};

/// 探针统计。
#[derive(Debug, Default)]
pub struct ProbeStats {
    read_pending: AtomicBool,
    violations: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl ProbeStats {
    /// 读取挂起期间开始写入（或刷新）的次数。
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// 完成的读取次数（含失败与被打断的读取）。
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// 完成的写入次数。
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_exclusive(&self) {
        if self.read_pending.load(Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// 读写排他探针。
///
/// `poll_read` 返回 `Pending` 时标记“读取挂起”，返回 `Ready` 时清除；`poll_write`/`poll_flush`
/// 在标记存在时计一次违例。`poll_shutdown` 只在两个循环停止后发生，不做检查。
#[derive(Debug)]
pub struct ExclusiveIoProbe<S> {
    inner: S,
    stats: Arc<ProbeStats>,
}

impl<S> ExclusiveIoProbe<S> {
    pub fn new(inner: S, stats: Arc<ProbeStats>) -> Self {
        Self { inner, stats }
    }

    pub fn stats(&self) -> &Arc<ProbeStats> {
        &self.stats
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ExclusiveIoProbe<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        match &polled {
            Poll::Pending => this.stats.read_pending.store(true, Ordering::SeqCst),
            Poll::Ready(_) => {
                this.stats.read_pending.store(false, Ordering::SeqCst);
                this.stats.reads.fetch_add(1, Ordering::SeqCst);
            }
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ExclusiveIoProbe<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.stats.check_exclusive();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(_)) = &polled {
            this.stats.writes.fetch_add(1, Ordering::SeqCst);
        }
        polled
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.stats.check_exclusive();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// 直通包裹服务：握手即成功，“加密流”就是套了探针的裸流。
#[derive(Debug)]
pub struct PassthroughWrapper {
    concurrent_io: bool,
    wraps: AtomicUsize,
    closes: AtomicUsize,
    stats: Arc<ProbeStats>,
}

impl Default for PassthroughWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthroughWrapper {
    pub fn new() -> Self {
        Self {
            concurrent_io: true,
            wraps: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            stats: Arc::default(),
        }
    }

    /// 声明加密流禁止读写并发。
    pub fn without_concurrent_io(mut self) -> Self {
        self.concurrent_io = false;
        self
    }

    pub fn wrap_calls(&self) -> usize {
        self.wraps.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn probe_stats(&self) -> Arc<ProbeStats> {
        Arc::clone(&self.stats)
    }
}

impl StreamWrapper for PassthroughWrapper {
    type Stream = ExclusiveIoProbe<RawStream>;
    type Credential = ();

    fn wrap<'a>(
        &'a self,
        raw: RawStream,
        _role: TlsRole,
        _credential: &'a Self::Credential,
        _ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<Self::Stream, BridgeError>> {
        self.wraps.fetch_add(1, Ordering::SeqCst);
        let stream = ExclusiveIoProbe::new(raw, Arc::clone(&self.stats));
        Box::pin(async move { Ok(stream) })
    }

    fn close<'a>(
        &'a self,
        mut stream: Self::Stream,
        _ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            stream
                .shutdown()
                .await
                .map_err(|err| BridgeError::close_with_source("passthrough shutdown failed", err))
        })
    }

    fn supports_concurrent_io(&self) -> bool {
        self.concurrent_io
    }
}

/// 握手总是失败的包裹服务。
#[derive(Debug, Default)]
pub struct RejectingWrapper {
    wraps: AtomicUsize,
    closes: AtomicUsize,
}

impl RejectingWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap_calls(&self) -> usize {
        self.wraps.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl StreamWrapper for RejectingWrapper {
    type Stream = RawStream;
    type Credential = ();

    fn wrap<'a>(
        &'a self,
        _raw: RawStream,
        _role: TlsRole,
        _credential: &'a Self::Credential,
        _ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<Self::Stream, BridgeError>> {
        self.wraps.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(BridgeError::handshake("peer rejected the handshake")) })
    }

    fn close<'a>(
        &'a self,
        _stream: Self::Stream,
        _ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}
