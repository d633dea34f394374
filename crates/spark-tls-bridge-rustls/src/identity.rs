use std::fmt;

use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject};

use crate::error::TlsSetupError;

/// 本端证书链与私钥。
///
/// 私钥不参与 `Debug` 输出。
pub struct TlsIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// 以 DER 证书链与私钥构造；证书链不能为空，首个证书为叶子证书。
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsSetupError> {
        if chain.is_empty() {
            return Err(TlsSetupError::identity("certificate chain is empty"));
        }
        Ok(Self { chain, key })
    }

    /// 从 PEM 文本解析证书链（可含多个 `CERTIFICATE` 块）与第一个私钥块。
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsSetupError> {
        let chain = CertificateDer::pem_slice_iter(chain_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| TlsSetupError::pem("unreadable certificate pem", err))?;
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|err| TlsSetupError::pem("unreadable private key pem", err))?;
        Self::from_der(chain, key)
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub(crate) fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// 桥接器构造时提供一次的凭据，决定本端能扮演的角色。
///
/// # 契约（What）
/// - `Server`：持有本端身份，供服务端角色握手；
/// - `Client`：持有信任根与 SNI 主机名，供客户端角色校验对端证书。
///
/// 凭据与 [`TlsRole`](spark_tls_bridge::TlsRole) 不匹配时，握手直接失败而不触碰传输通道。
#[derive(Clone, Debug)]
pub enum TlsCredential {
    Server {
        identity: TlsIdentity,
    },
    Client {
        server_name: ServerName<'static>,
        roots: RootCertStore,
    },
}

impl TlsCredential {
    pub fn server(identity: TlsIdentity) -> Self {
        TlsCredential::Server { identity }
    }

    /// 客户端凭据：`server_name` 同时用于 SNI 与证书主机名校验。
    pub fn client<I>(server_name: &str, roots: I) -> Result<Self, TlsSetupError>
    where
        I: IntoIterator<Item = CertificateDer<'static>>,
    {
        let name = ServerName::try_from(server_name.to_owned()).map_err(|_| {
            TlsSetupError::ServerName {
                name: server_name.to_owned(),
            }
        })?;
        let mut store = RootCertStore::empty();
        for root in roots {
            store.add(root)?;
        }
        if store.is_empty() {
            return Err(TlsSetupError::identity("client credential needs at least one trust root"));
        }
        Ok(TlsCredential::Client {
            server_name: name,
            roots: store,
        })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            TlsCredential::Server { .. } => "server",
            TlsCredential::Client { .. } => "client",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_is_rejected() {
        let key = PrivateKeyDer::Pkcs8(vec![0u8; 8].into());
        let err = TlsIdentity::from_der(Vec::new(), key).expect_err("empty chain");
        assert!(matches!(err, TlsSetupError::Identity { .. }));
    }

    #[test]
    fn pem_without_key_is_rejected() {
        let err = TlsIdentity::from_pem(b"", b"not a pem").expect_err("no key block");
        assert!(matches!(err, TlsSetupError::Identity { source: Some(_), .. }));
    }

    #[test]
    fn client_credential_validates_name_and_roots() {
        let err = TlsCredential::client("not a valid name!", Vec::new()).expect_err("bad name");
        assert!(matches!(err, TlsSetupError::ServerName { .. }));

        let err = TlsCredential::client("localhost", Vec::new()).expect_err("no roots");
        assert!(matches!(err, TlsSetupError::Identity { .. }));
    }
}
