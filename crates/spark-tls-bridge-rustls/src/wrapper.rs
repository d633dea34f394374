use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rustls::{ClientConfig, RootCertStore, ServerConfig, crypto::CryptoProvider};
use rustls_pki_types::ServerName;
use spark_tls_bridge::{BridgeError, CallContext, RawStream, StreamWrapper, TlsRole};
use tokio::io::AsyncWriteExt;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

use crate::{
    error::{config_error, handshake_error},
    identity::{TlsCredential, TlsIdentity},
};

/// 最近一次握手协商出的会话参数。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NegotiatedSession {
    /// 协商出的 ALPN 协议标识。
    pub alpn_protocol: Option<Vec<u8>>,
    /// 服务端角色下为客户端提供的 SNI，客户端角色下为本端请求的主机名。
    pub server_name: Option<String>,
}

/// 基于 `rustls` + `tokio-rustls` 的包裹服务。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把桥接器的 [`RawStream`] 升级为 TLS 流：服务端角色走 `TlsAcceptor`，客户端角色走 `TlsConnector`；
/// - 密码学后端在构造时显式注入（缺省为 `ring`），不依赖进程级默认 provider 的安装顺序。
///
/// ## 逻辑（How）
/// - 每次 `wrap` 根据凭据现场构造 `ServerConfig`/`ClientConfig`，并写入 ALPN 列表；
/// - 握手成功后记录 ALPN 与 SNI，供上层通过 [`negotiated`](Self::negotiated) 做协议选择；
/// - `close` 发送 `close_notify` 并刷新，底层裸流的关闭只刷新而不会关闭调用方通道。
///
/// ## 契约（What）
/// - 握手失败返回 [`BridgeError::Handshake`]，其 source 为 [`TlsHandshakeError`](crate::TlsHandshakeError)，
///   可用 [`handshake_failure`](crate::handshake_failure) 取回分类；
/// - 角色与凭据不匹配时立即失败，不读写传输通道。
///
/// ## 风险与权衡（Trade-offs）
/// - `tokio-rustls` 的流允许读写并发，缺省声明 `supports_concurrent_io = true`；
///   [`without_concurrent_io`](Self::without_concurrent_io) 可强制桥接器启用写排他。
pub struct RustlsStreamWrapper {
    provider: Arc<CryptoProvider>,
    alpn_protocols: Vec<Vec<u8>>,
    concurrent_io: bool,
    negotiated: Mutex<Option<NegotiatedSession>>,
}

impl Default for RustlsStreamWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl RustlsStreamWrapper {
    /// 使用 `ring` 密码学后端。
    pub fn new() -> Self {
        Self::with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    }

    pub fn with_provider(provider: Arc<CryptoProvider>) -> Self {
        Self {
            provider,
            alpn_protocols: Vec::new(),
            concurrent_io: true,
            negotiated: Mutex::new(None),
        }
    }

    /// 按偏好顺序声明 ALPN 协议。
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// 声明加密流禁止读写并发。
    pub fn without_concurrent_io(mut self) -> Self {
        self.concurrent_io = false;
        self
    }

    /// 最近一次成功握手的协商结果。
    pub fn negotiated(&self) -> Option<NegotiatedSession> {
        self.negotiated.lock().clone()
    }

    fn server_config(&self, identity: &TlsIdentity) -> Result<Arc<ServerConfig>, BridgeError> {
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(config_error)?
            .with_no_client_auth()
            .with_single_cert(identity.chain().to_vec(), identity.key())
            .map_err(config_error)?;
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }

    fn client_config(&self, roots: &RootCertStore) -> Result<Arc<ClientConfig>, BridgeError> {
        let mut config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(config_error)?
            .with_root_certificates(roots.clone())
            .with_no_client_auth();
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }

    async fn accept(
        &self,
        raw: RawStream,
        identity: &TlsIdentity,
    ) -> Result<TlsStream<RawStream>, BridgeError> {
        let acceptor = TlsAcceptor::from(self.server_config(identity)?);
        let stream = acceptor.accept(raw).await.map_err(handshake_error)?;
        let (_, connection) = stream.get_ref();
        self.record(NegotiatedSession {
            alpn_protocol: connection.alpn_protocol().map(<[u8]>::to_vec),
            server_name: connection.server_name().map(str::to_owned),
        });
        Ok(TlsStream::from(stream))
    }

    async fn connect(
        &self,
        raw: RawStream,
        server_name: &ServerName<'static>,
        roots: &RootCertStore,
    ) -> Result<TlsStream<RawStream>, BridgeError> {
        let connector = TlsConnector::from(self.client_config(roots)?);
        let stream = connector
            .connect(server_name.clone(), raw)
            .await
            .map_err(handshake_error)?;
        let (_, connection) = stream.get_ref();
        self.record(NegotiatedSession {
            alpn_protocol: connection.alpn_protocol().map(<[u8]>::to_vec),
            server_name: Some(server_name.to_str().into_owned()),
        });
        Ok(TlsStream::from(stream))
    }

    fn record(&self, session: NegotiatedSession) {
        debug!(
            alpn = ?session.alpn_protocol.as_deref().map(String::from_utf8_lossy),
            server_name = ?session.server_name,
            "rustls session negotiated"
        );
        *self.negotiated.lock() = Some(session);
    }
}

impl StreamWrapper for RustlsStreamWrapper {
    type Stream = TlsStream<RawStream>;
    type Credential = TlsCredential;

    fn wrap<'a>(
        &'a self,
        raw: RawStream,
        role: TlsRole,
        credential: &'a Self::Credential,
        _ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<Self::Stream, BridgeError>> {
        Box::pin(async move {
            match (role, credential) {
                (TlsRole::Server, TlsCredential::Server { identity }) => {
                    self.accept(raw, identity).await
                }
                (TlsRole::Client, TlsCredential::Client { server_name, roots }) => {
                    self.connect(raw, server_name, roots).await
                }
                (role, credential) => Err(BridgeError::handshake(format!(
                    "{role:?} role cannot handshake with a {} credential",
                    credential.kind()
                ))),
            }
        })
    }

    fn close<'a>(
        &'a self,
        mut stream: Self::Stream,
        _ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            stream
                .shutdown()
                .await
                .map_err(|err| BridgeError::close_with_source("tls close_notify failed", err))
        })
    }

    fn supports_concurrent_io(&self) -> bool {
        self.concurrent_io
    }
}

impl fmt::Debug for RustlsStreamWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsStreamWrapper")
            .field("alpn_protocols", &self.alpn_protocols.len())
            .field("concurrent_io", &self.concurrent_io)
            .finish_non_exhaustive()
    }
}
