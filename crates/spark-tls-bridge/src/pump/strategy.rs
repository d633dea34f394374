use std::{fmt, io, sync::Arc};

use futures::future::BoxFuture;

use crate::channel::{ChannelReader, ChannelWriter};

/// 循环的读取策略。
///
/// 返回 `Ok(0)` 表示 source 已结束；以 `ErrorKind::Interrupted` 完成的读取视为被暂停协议打断，
/// 循环会重新回到检查点而不是终止。
pub trait ByteSource: Send + 'static {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;
}

/// 循环的写入策略。
///
/// `write` 的 Future 在返回 `Pending` 期间被丢弃时不得已经接受任何字节：循环在暂停或停止时
/// 会直接丢弃挂起中的写入，并在恢复后以同一段数据重新发起。
pub trait ByteSink: Send + 'static {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>>;

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// 以通道可读端为 source。
pub struct ChannelSource {
    reader: Arc<dyn ChannelReader>,
}

impl ChannelSource {
    pub fn new(reader: Arc<dyn ChannelReader>) -> Self {
        Self { reader }
    }
}

impl ByteSource for ChannelSource {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for ChannelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSource").finish_non_exhaustive()
    }
}

/// 以通道可写端为 sink。
pub struct ChannelSink {
    writer: Arc<dyn ChannelWriter>,
}

impl ChannelSink {
    pub fn new(writer: Arc<dyn ChannelWriter>) -> Self {
        Self { writer }
    }
}

impl ByteSink for ChannelSink {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        self.writer.write(data)
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.writer.flush()
    }
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSink").finish_non_exhaustive()
    }
}
