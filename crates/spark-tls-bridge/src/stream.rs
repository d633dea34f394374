use std::{fmt, io, sync::Arc};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex as AsyncMutex,
};

use crate::pump::{ByteSink, ByteSource};

/// 握手产出的加密流在会话期间的共享形态。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 接收循环只读、发送循环只写、编排器在两个循环停止后负责回收并关闭，三方共享同一个流对象；
/// - 读写两侧各自加锁，读取挂起时写入不会被读锁阻塞。
///
/// ## 逻辑（How）
/// - 构造时以 `tokio::io::split` 拆成读/写半部，分别放入 `Option` 并由异步互斥锁保护；
/// - [`reunite`](Self::reunite) 取出两个半部并 `unsplit` 回原始流，交给关闭服务；之后的读写返回 `NotConnected`。
pub struct WrappedStream<S> {
    halves: Arc<Halves<S>>,
}

struct Halves<S> {
    reader: AsyncMutex<Option<ReadHalf<S>>>,
    writer: AsyncMutex<Option<WriteHalf<S>>>,
}

impl<S> WrappedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            halves: Arc::new(Halves {
                reader: AsyncMutex::new(Some(reader)),
                writer: AsyncMutex::new(Some(writer)),
            }),
        }
    }

    /// 读侧视图，作为接收循环的 source。
    pub fn reader(&self) -> WrappedReader<S> {
        WrappedReader {
            halves: Arc::clone(&self.halves),
        }
    }

    /// 写侧视图，作为发送循环的 sink。
    pub fn writer(&self) -> WrappedWriter<S> {
        WrappedWriter {
            halves: Arc::clone(&self.halves),
        }
    }

    /// 取回完整的流；任一半部已被取走时返回 `None`。
    pub async fn reunite(&self) -> Option<S> {
        let reader = self.halves.reader.lock().await.take();
        let writer = self.halves.writer.lock().await.take();
        match (reader, writer) {
            (Some(reader), Some(writer)) => Some(reader.unsplit(writer)),
            _ => None,
        }
    }
}

impl<S> Clone for WrappedStream<S> {
    fn clone(&self) -> Self {
        Self {
            halves: Arc::clone(&self.halves),
        }
    }
}

impl<S> fmt::Debug for WrappedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedStream").finish_non_exhaustive()
    }
}

fn reclaimed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "wrapped stream already reclaimed")
}

/// 加密流读侧。
pub struct WrappedReader<S> {
    halves: Arc<Halves<S>>,
}

impl<S> ByteSource for WrappedReader<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let mut guard = self.halves.reader.lock().await;
            match guard.as_mut() {
                Some(reader) => reader.read(buf).await,
                None => Err(reclaimed()),
            }
        })
    }
}

/// 加密流写侧。
pub struct WrappedWriter<S> {
    halves: Arc<Halves<S>>,
}

impl<S> ByteSink for WrappedWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let mut guard = self.halves.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.write(data).await,
                None => Err(reclaimed()),
            }
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut guard = self.halves.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.flush().await,
                None => Err(reclaimed()),
            }
        })
    }
}
