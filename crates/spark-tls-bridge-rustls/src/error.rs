use std::{borrow::Cow, fmt, io};

use rustls::{AlertDescription, Error as RustlsError};
use spark_tls_bridge::BridgeError;
use thiserror::Error;

/// rustls 握手失败的分类。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 桥接层只看到 [`BridgeError::Handshake`]，上层却需要区分“证书不被信任”与“对端中途断开”，
///   前者应告警、后者可重试；
/// - 分类结果以稳定错误码暴露，运维脚本无需解析 rustls 的错误文案。
///
/// ## 逻辑（How）
/// - `tokio-rustls` 把 rustls 错误包进 `io::Error`，先尝试向下转型，再按 TLS Alert 细分；
/// - 其余纯 I/O 错误按 `ErrorKind` 归入 `Transport` 或 `Resource`。
///
/// ## 风险与权衡（Trade-offs）
/// - 未穷举的 rustls 错误与 Alert 归为 `Transport`，宁可漏报安全事件也不误报。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeFailure {
    /// 证书缺失、过期、不受信任或对端拒绝授权。
    Authentication,
    /// 协议违例：非法消息、解密失败、不兼容的参数。
    Integrity,
    /// 链路层故障：对端断开、被打断、握手未完成，通常可重试。
    Transport,
    /// 本端资源或环境问题：随机数、时钟、密钥不一致。
    Resource,
}

impl HandshakeFailure {
    pub fn code(self) -> &'static str {
        match self {
            HandshakeFailure::Authentication => "spark.tls_bridge.rustls.authentication",
            HandshakeFailure::Integrity => "spark.tls_bridge.rustls.integrity",
            HandshakeFailure::Transport => "spark.tls_bridge.rustls.transport",
            HandshakeFailure::Resource => "spark.tls_bridge.rustls.resource",
        }
    }

    /// 是否值得在新连接上重试。
    pub fn is_retryable(self) -> bool {
        matches!(self, HandshakeFailure::Transport)
    }

    /// 对 `tokio-rustls` 返回的握手错误分类。
    pub fn classify(error: &io::Error) -> Self {
        if let Some(source) = error.get_ref()
            && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
        {
            return classify_rustls_error(rustls_error);
        }
        classify_io_error(error)
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandshakeFailure::Authentication => "authentication",
            HandshakeFailure::Integrity => "integrity",
            HandshakeFailure::Transport => "transport",
            HandshakeFailure::Resource => "resource",
        };
        f.write_str(label)
    }
}

/// 挂在 [`BridgeError::Handshake`] 上的底层错误，携带分类结果。
#[derive(Debug, Error)]
#[error("{failure} failure: {source}")]
pub struct TlsHandshakeError {
    failure: HandshakeFailure,
    #[source]
    source: io::Error,
}

impl TlsHandshakeError {
    pub fn failure(&self) -> HandshakeFailure {
        self.failure
    }

    pub fn io_error(&self) -> &io::Error {
        &self.source
    }
}

/// 构造证书、信任根或 rustls 配置时的错误。
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("invalid tls identity: {detail}")]
    Identity {
        detail: Cow<'static, str>,
        #[source]
        source: Option<rustls_pki_types::pem::Error>,
    },

    #[error("invalid server name {name:?}")]
    ServerName { name: String },

    #[error("rustls rejected the configuration: {0}")]
    Rustls(#[from] RustlsError),
}

impl TlsSetupError {
    pub(crate) fn identity(detail: impl Into<Cow<'static, str>>) -> Self {
        TlsSetupError::Identity {
            detail: detail.into(),
            source: None,
        }
    }

    pub(crate) fn pem(detail: &'static str, source: rustls_pki_types::pem::Error) -> Self {
        TlsSetupError::Identity {
            detail: Cow::Borrowed(detail),
            source: Some(source),
        }
    }
}

/// 从桥接错误中取回握手失败分类；非 rustls 握手错误返回 `None`。
pub fn handshake_failure(error: &BridgeError) -> Option<HandshakeFailure> {
    let source = std::error::Error::source(error)?;
    source
        .downcast_ref::<TlsHandshakeError>()
        .map(TlsHandshakeError::failure)
}

pub(crate) fn handshake_error(source: io::Error) -> BridgeError {
    let failure = HandshakeFailure::classify(&source);
    BridgeError::handshake_with_source(
        format!("rustls handshake rejected ({})", failure.code()),
        TlsHandshakeError { failure, source },
    )
}

pub(crate) fn config_error(source: RustlsError) -> BridgeError {
    BridgeError::handshake_with_source("rustls configuration rejected", TlsSetupError::from(source))
}

fn classify_rustls_error(error: &RustlsError) -> HandshakeFailure {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord
        | NoApplicationProtocol => HandshakeFailure::Integrity,
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => HandshakeFailure::Authentication,
        FailedToGetCurrentTime
        | FailedToGetRandomBytes
        | BadMaxFragmentSize
        | InconsistentKeys(_) => HandshakeFailure::Resource,
        AlertReceived(alert) => classify_alert(alert),
        _ => HandshakeFailure::Transport,
    }
}

fn classify_alert(alert: &AlertDescription) -> HandshakeFailure {
    use AlertDescription as Alert;
    match alert {
        Alert::BadCertificate
        | Alert::UnsupportedCertificate
        | Alert::CertificateRevoked
        | Alert::CertificateExpired
        | Alert::CertificateUnknown
        | Alert::UnknownCA
        | Alert::NoCertificate
        | Alert::CertificateUnobtainable
        | Alert::CertificateRequired
        | Alert::AccessDenied => HandshakeFailure::Authentication,
        Alert::DecodeError
        | Alert::DecryptError
        | Alert::DecryptionFailed
        | Alert::HandshakeFailure
        | Alert::IllegalParameter
        | Alert::RecordOverflow
        | Alert::BadRecordMac
        | Alert::UnexpectedMessage
        | Alert::InsufficientSecurity
        | Alert::InappropriateFallback
        | Alert::MissingExtension
        | Alert::UnsupportedExtension
        | Alert::BadCertificateStatusResponse
        | Alert::BadCertificateHashValue
        | Alert::UnknownPSKIdentity
        | Alert::UnrecognisedName
        | Alert::NoApplicationProtocol
        | Alert::ProtocolVersion => HandshakeFailure::Integrity,
        Alert::InternalError | Alert::DecompressionFailure => HandshakeFailure::Resource,
        _ => HandshakeFailure::Transport,
    }
}

fn classify_io_error(error: &io::Error) -> HandshakeFailure {
    match error.kind() {
        io::ErrorKind::WriteZero | io::ErrorKind::OutOfMemory => HandshakeFailure::Resource,
        io::ErrorKind::InvalidData => HandshakeFailure::Integrity,
        _ => HandshakeFailure::Transport,
    }
}

#[cfg(test)]
mod tests {
    use rustls::CertificateError;

    use super::*;

    fn wrapped(error: RustlsError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }

    #[test]
    fn certificate_problems_are_authentication_failures() {
        let err = wrapped(RustlsError::InvalidCertificate(CertificateError::UnknownIssuer));
        assert_eq!(HandshakeFailure::classify(&err), HandshakeFailure::Authentication);

        let alert = wrapped(RustlsError::AlertReceived(AlertDescription::UnknownCA));
        assert_eq!(HandshakeFailure::classify(&alert), HandshakeFailure::Authentication);
    }

    #[test]
    fn protocol_violations_are_integrity_failures() {
        assert_eq!(
            HandshakeFailure::classify(&wrapped(RustlsError::DecryptError)),
            HandshakeFailure::Integrity
        );
        assert_eq!(
            HandshakeFailure::classify(&wrapped(RustlsError::AlertReceived(
                AlertDescription::HandshakeFailure
            ))),
            HandshakeFailure::Integrity
        );
    }

    #[test]
    fn plain_io_errors_fall_back_to_kind() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed");
        assert_eq!(HandshakeFailure::classify(&eof), HandshakeFailure::Transport);
        assert!(HandshakeFailure::Transport.is_retryable());

        let zero = io::Error::new(io::ErrorKind::WriteZero, "no room");
        assert_eq!(HandshakeFailure::classify(&zero), HandshakeFailure::Resource);
    }

    #[test]
    fn classification_survives_the_bridge_error() {
        let err = handshake_error(wrapped(RustlsError::NoCertificatesPresented));
        assert_eq!(err.code(), "spark.tls_bridge.handshake_failed");
        assert_eq!(handshake_failure(&err), Some(HandshakeFailure::Authentication));
        assert_eq!(handshake_failure(&BridgeError::handshake("other")), None);
    }
}
