use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, Notify},
};

use crate::error::read_cancelled;

/// 通道可读端：按块消费字节序列，并支持取消挂起中的读取。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 桥接器两侧的通道（传输侧、应用侧）均由调用方持有，桥接器只通过该契约读取，从不关闭；
/// - 暂停协议依赖“取消挂起读取”能力打断一个可能永远不会完成的读取，因此它必须是契约的一部分。
///
/// ## 契约（What）
/// - `read`：读取至多 `buf.len()` 字节，返回 `Ok(0)` 表示对端已结束；
/// - `cancel_pending_read`：若当前有挂起读取，使其以 `ErrorKind::Interrupted` 完成；若当前没有，
///   则让**下一次**读取立即以 `Interrupted` 返回（粘滞语义），保证“先取消、后读取”的竞态不会丢失取消；
/// - `clear_pending_cancel`：撤销尚未被任何读取消费的粘滞取消。桥接器在循环退出时调用，
///   把通道以“没有残留取消”的状态交还调用方；
/// - 被取消的读取不得消费任何字节。
pub trait ChannelReader: Send + Sync + 'static {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;

    fn cancel_pending_read(&self);

    fn clear_pending_cancel(&self);
}

/// 通道可写端。
///
/// - `write`：写入至多 `data.len()` 字节并返回实际写入量；Future 在返回 `Pending` 期间被丢弃时不得写入任何字节；
/// - `flush`：把已接受的字节推送到底层。
pub trait ChannelWriter: Send + Sync + 'static {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>>;

    fn flush(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// 一侧通道端点：(可读端, 可写端)。
///
/// 克隆成本为两次 `Arc` 引用计数递增；桥接器与调用方各持一份克隆。
#[derive(Clone)]
pub struct DuplexChannel {
    reader: Arc<dyn ChannelReader>,
    writer: Arc<dyn ChannelWriter>,
}

impl DuplexChannel {
    /// 由任意读写端组装通道端点。
    pub fn new(reader: Arc<dyn ChannelReader>, writer: Arc<dyn ChannelWriter>) -> Self {
        Self { reader, writer }
    }

    /// 以 Tokio 字节流构造端点，内部拆分为读半部与写半部。
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::new(
            Arc::new(StreamReader::new(read_half)),
            Arc::new(StreamWriter::new(write_half)),
        )
    }

    pub fn reader(&self) -> &Arc<dyn ChannelReader> {
        &self.reader
    }

    pub fn writer(&self) -> &Arc<dyn ChannelWriter> {
        &self.writer
    }
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel").finish_non_exhaustive()
    }
}

/// 粘滞取消信号：原子位记录“有待消费的取消”，`Notify` 唤醒挂起中的读取。
#[derive(Debug, Default)]
struct CancelSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }
}

/// 基于 Tokio `AsyncRead` 的可读端实现。
///
/// ## 逻辑（How）
/// - 以 `tokio::sync::Mutex` 包裹读半部，保证同一时刻只有一个读取；
/// - 读取开始前先登记取消等待者并检查粘滞位，随后以 `biased` 的 `select!` 让取消优先于数据；
/// - `AsyncReadExt::read` 是取消安全的：被丢弃时不会消费字节。
#[derive(Debug)]
pub struct StreamReader<R> {
    inner: AsyncMutex<R>,
    cancel: CancelSignal,
}

impl<R> StreamReader<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            inner: AsyncMutex::new(reader),
            cancel: CancelSignal::default(),
        }
    }

    async fn read_or_cancel(&self, buf: &mut [u8]) -> io::Result<usize> {
        let cancelled = self.cancel.notify.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        if self.cancel.take() {
            return Err(read_cancelled());
        }

        let mut guard = tokio::select! {
            biased;
            _ = &mut cancelled => {
                self.cancel.take();
                return Err(read_cancelled());
            }
            guard = self.inner.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = &mut cancelled => {
                self.cancel.take();
                Err(read_cancelled())
            }
            result = guard.read(buf) => result,
        }
    }
}

impl<R> ChannelReader for StreamReader<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(self.read_or_cancel(buf))
    }

    fn cancel_pending_read(&self) {
        self.cancel.request();
    }

    fn clear_pending_cancel(&self) {
        self.cancel.take();
    }
}

/// 基于 Tokio `AsyncWrite` 的可写端实现。
#[derive(Debug)]
pub struct StreamWriter<W> {
    inner: AsyncMutex<W>,
}

impl<W> StreamWriter<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(writer: W) -> Self {
        Self {
            inner: AsyncMutex::new(writer),
        }
    }
}

impl<W> ChannelWriter for StreamWriter<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            guard.write(data).await
        })
    }

    fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            guard.flush().await
        })
    }
}
