use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    channel::{ChannelReader, ChannelWriter, DuplexChannel},
    error::is_read_cancelled,
};

const DEFAULT_CHUNK: usize = 16 * 1024;

/// 传输侧通道的“裸流”视图，交给握手服务作为 TLS 底层 I/O。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `tokio-rustls` 等实现只接受 `AsyncRead + AsyncWrite`，而传输侧端点是调用方持有、可共享的
///   [`DuplexChannel`]；本类型在两者之间做一次适配，且不取得通道的所有权；
/// - 经由 [`ReadInterrupter`] 发起的“取消挂起读取”会以 `ErrorKind::Interrupted` 从 `poll_read` 冒出，
///   穿过 TLS 层到达接收循环，这是接收方向暂停时让加密流上的读取**完成**而不是被悬挂的关键路径；
/// - 不是经由本视图发起的取消（例如上一个会话残留的粘滞取消）会被吞掉并重新发起读取，
///   避免它在握手阶段被误当成 I/O 失败。
///
/// ## 逻辑（How）
/// - `poll_read` 把一次通道读取保存为拥有缓冲区的 `BoxFuture`，完成后把数据拷入 `ReadBuf`，
///   多出的部分以 [`Bytes`] 暂存，下一次 `poll_read` 优先交付；
/// - `poll_write` 在首次调用时复制调用方数据并保存写 Future；之后的轮询继续推进同一个 Future。
///   TLS 引擎在写入返回 `Pending` 后会以相同的前缀字节重试，因此返回的字节数与调用方缓冲区一致；
/// - `poll_shutdown` 只做刷新：桥接器从不关闭调用方的通道。
///
/// ## 风险与权衡（Trade-offs）
/// - 每次通道读取都会分配一个 `chunk` 大小的缓冲区，换取实现简单；
/// - 写路径复制一次明文（此处实为密文）字节，代价与一次系统调用相比可以忽略。
pub struct RawStream {
    reader: Arc<dyn ChannelReader>,
    writer: Arc<dyn ChannelWriter>,
    chunk: usize,
    armed: Arc<AtomicBool>,
    leftover: Bytes,
    pending_read: Option<BoxFuture<'static, io::Result<Bytes>>>,
    pending_write: Option<BoxFuture<'static, io::Result<usize>>>,
    pending_flush: Option<BoxFuture<'static, io::Result<()>>>,
}

impl RawStream {
    /// 基于传输侧通道构造裸流视图。
    pub fn new(channel: &DuplexChannel) -> Self {
        Self::with_chunk_size(channel, DEFAULT_CHUNK)
    }

    /// 指定单次通道读取的缓冲区大小。
    pub fn with_chunk_size(channel: &DuplexChannel, chunk: usize) -> Self {
        Self {
            reader: Arc::clone(channel.reader()),
            writer: Arc::clone(channel.writer()),
            chunk: chunk.max(1),
            armed: Arc::new(AtomicBool::new(false)),
            leftover: Bytes::new(),
            pending_read: None,
            pending_write: None,
            pending_flush: None,
        }
    }

    /// 返回可跨任务使用的读取打断句柄。
    pub fn interrupter(&self) -> ReadInterrupter {
        ReadInterrupter {
            reader: Arc::clone(&self.reader),
            armed: Arc::clone(&self.armed),
        }
    }

    fn read_chunk(
        reader: Arc<dyn ChannelReader>,
        chunk: usize,
    ) -> BoxFuture<'static, io::Result<Bytes>> {
        Box::pin(async move {
            let mut buf = vec![0u8; chunk];
            let n = reader.read(&mut buf).await?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        })
    }

    fn write_chunk(
        writer: Arc<dyn ChannelWriter>,
        data: Bytes,
    ) -> BoxFuture<'static, io::Result<usize>> {
        Box::pin(async move { writer.write(&data).await })
    }

    fn flush_channel(writer: Arc<dyn ChannelWriter>) -> BoxFuture<'static, io::Result<()>> {
        Box::pin(async move { writer.flush().await })
    }

    fn drain_leftover(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover[..n]);
        self.leftover.advance(n);
    }
}

impl AsyncRead for RawStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.leftover.is_empty() {
            this.drain_leftover(buf);
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            let reader = Arc::clone(&this.reader);
            let chunk = this.chunk;
            let pending = this
                .pending_read
                .get_or_insert_with(|| Self::read_chunk(reader, chunk));
            let result = ready!(pending.as_mut().poll(cx));
            this.pending_read = None;

            match result {
                Ok(data) => {
                    this.leftover = data;
                    this.drain_leftover(buf);
                    return Poll::Ready(Ok(()));
                }
                // 不是本视图请求的取消：重新发起读取。
                Err(err) if is_read_cancelled(&err) && !this.armed.swap(false, Ordering::AcqRel) => {
                    continue;
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() && this.pending_write.is_none() {
            return Poll::Ready(Ok(0));
        }
        let writer = Arc::clone(&this.writer);
        let pending = this
            .pending_write
            .get_or_insert_with(|| Self::write_chunk(writer, Bytes::copy_from_slice(buf)));
        let result = ready!(pending.as_mut().poll(cx));
        this.pending_write = None;
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(pending) = this.pending_write.as_mut() {
            // 未完成的写入先落地，随后的 flush 才有意义；其写入量已无人认领，丢弃即可。
            let result = ready!(pending.as_mut().poll(cx));
            this.pending_write = None;
            result?;
        }
        let writer = Arc::clone(&this.writer);
        let pending = this
            .pending_flush
            .get_or_insert_with(|| Self::flush_channel(writer));
        let result = ready!(pending.as_mut().poll(cx));
        this.pending_flush = None;
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

/// 打断 [`RawStream`] 上挂起读取的句柄。
///
/// `interrupt` 先“上膛”再取消通道读取：通道读取以 `Interrupted` 完成后，裸流看到上膛标记才会把
/// 错误交给上层；若此刻没有挂起读取，通道的粘滞取消会让下一次读取立即完成，效果相同。
#[derive(Clone)]
pub struct ReadInterrupter {
    reader: Arc<dyn ChannelReader>,
    armed: Arc<AtomicBool>,
}

impl ReadInterrupter {
    pub fn interrupt(&self) {
        self.armed.store(true, Ordering::Release);
        self.reader.cancel_pending_read();
    }

    /// 撤销尚未生效的打断：解除上膛并清掉通道上的粘滞取消。
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
        self.reader.clear_pending_cancel();
    }
}

impl fmt::Debug for ReadInterrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadInterrupter")
            .field("armed", &self.armed.load(Ordering::Acquire))
            .finish()
    }
}

impl fmt::Debug for RawStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStream")
            .field("chunk", &self.chunk)
            .field("leftover", &self.leftover.len())
            .field("read_pending", &self.pending_read.is_some())
            .field("write_pending", &self.pending_write.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn small_reads_drain_leftover_in_order() {
        let (local, mut peer) = tokio::io::duplex(256);
        let channel = DuplexChannel::from_stream(local);
        let mut raw = RawStream::new(&channel);

        peer.write_all(b"abcdefgh").await.expect("peer write");
        let mut out = Vec::new();
        let mut two = [0u8; 2];
        while out.len() < 8 {
            let n = raw.read(&mut two).await.expect("raw read");
            out.extend_from_slice(&two[..n]);
        }
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn writes_reach_peer_and_shutdown_keeps_channel_open() {
        let (local, mut peer) = tokio::io::duplex(256);
        let channel = DuplexChannel::from_stream(local);
        let mut raw = RawStream::new(&channel);

        raw.write_all(b"ping").await.expect("raw write");
        raw.shutdown().await.expect("raw shutdown");

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.expect("peer read");
        assert_eq!(&buf, b"ping");

        // 通道仍可继续使用。
        channel.writer().write(b"!").await.expect("channel still open");
    }

    #[tokio::test]
    async fn interrupter_surfaces_as_interrupted() {
        let (local, _peer) = tokio::io::duplex(256);
        let channel = DuplexChannel::from_stream(local);
        let mut raw = RawStream::new(&channel);

        let interrupter = raw.interrupter();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            interrupter.interrupt();
        });

        let mut buf = [0u8; 4];
        let err = tokio::time::timeout(Duration::from_secs(1), raw.read(&mut buf))
            .await
            .expect("read unblocked")
            .expect_err("interrupted");
        assert!(is_read_cancelled(&err));
    }

    #[tokio::test]
    async fn disarmed_interrupt_leaves_channel_readable() {
        let (local, mut peer) = tokio::io::duplex(256);
        let channel = DuplexChannel::from_stream(local);
        let raw = RawStream::new(&channel);

        let interrupter = raw.interrupter();
        interrupter.interrupt();
        interrupter.disarm();
        drop(raw);

        peer.write_all(b"ok").await.expect("peer write");
        let mut buf = [0u8; 2];
        let n = channel.reader().read(&mut buf).await.expect("no leftover cancel");
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn stray_channel_cancel_is_retried() {
        let (local, mut peer) = tokio::io::duplex(256);
        let channel = DuplexChannel::from_stream(local);
        let mut raw = RawStream::new(&channel);

        channel.reader().cancel_pending_read();
        peer.write_all(b"ok").await.expect("peer write");

        let mut buf = [0u8; 2];
        raw.read_exact(&mut buf).await.expect("stray cancel must not surface");
        assert_eq!(&buf, b"ok");
    }
}
