use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{contract::CallContext, error::BridgeError, raw::RawStream};

/// 握手中本端扮演的角色。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsRole {
    #[default]
    Server,
    Client,
}

/// 流的包裹/解包服务：在裸流上完成 TLS 握手，并在会话结束时关闭加密流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 桥接器不关心握手协议、证书信任策略或具体的 TLS 库，只需要一个“把裸流变成加密流、
///   再把加密流关掉”的异步服务；
/// - 不同实现对读写并发的支持不同，由 [`supports_concurrent_io`](Self::supports_concurrent_io)
///   在构造期一次性声明，桥接器据此决定发送方向是否需要写排他。
///
/// ## 契约（What）
/// - `wrap`：失败时返回 [`BridgeError::Handshake`]，且不得保留 `raw`；须遵守 `ctx` 的取消与截止；
/// - `close`：每个加密流只会被调用一次，且只在两个循环都停止之后；失败时返回 [`BridgeError::Close`]，
///   桥接器仍视流为已关闭；
/// - `close` 不应关闭底层传输通道：裸流的 `shutdown` 只刷新，通道的所有权始终在调用方。
pub trait StreamWrapper: Send + Sync + 'static {
    /// 握手产出的加密流。
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    /// 构造时提供一次的凭据，例如证书链与私钥。
    type Credential: Send + Sync + 'static;

    fn wrap<'a>(
        &'a self,
        raw: RawStream,
        role: TlsRole,
        credential: &'a Self::Credential,
        ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<Self::Stream, BridgeError>>;

    fn close<'a>(
        &'a self,
        stream: Self::Stream,
        ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<(), BridgeError>>;

    /// 加密流是否允许读写同时进行。
    fn supports_concurrent_io(&self) -> bool {
        true
    }
}
