#![doc = r#"
# spark-tls-bridge-rustls

## 设计动机（Why）
- 为 `spark-tls-bridge` 提供基于 `rustls` 的包裹服务，使桥接器无需感知具体 TLS 库；
- 握手失败按安全语义分类（认证 / 完整性 / 链路 / 资源），便于上层决定告警还是重试。

## 核心契约（What）
- [`RustlsStreamWrapper`]：实现 [`StreamWrapper`](spark_tls_bridge::StreamWrapper)，服务端与客户端角色皆可；
- [`TlsCredential`] / [`TlsIdentity`]：证书链、私钥与信任根，支持 DER 与 PEM；
- [`HandshakeFailure`] 与 [`handshake_failure`]：从桥接错误中取回分类。

## 实现策略（How）
- `tokio-rustls` 在桥接器提供的裸流上握手，密码学后端缺省为 `ring`；
- 握手协商出的 ALPN 与 SNI 记录在包裹服务上，供协议选择使用。

## 风险与考量（Trade-offs）
- 每次握手都会按凭据重建 rustls 配置，连接级升级场景下成本可忽略；
- 暂不支持双向认证，客户端证书校验可在 `server_config` 处扩展。
"#]

mod error;
mod identity;
mod wrapper;

pub use error::{HandshakeFailure, TlsHandshakeError, TlsSetupError, handshake_failure};
pub use identity::{TlsCredential, TlsIdentity};
pub use wrapper::{NegotiatedSession, RustlsStreamWrapper};
