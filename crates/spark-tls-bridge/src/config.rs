use std::time::Duration;

use serde::Deserialize;

use crate::{error::BridgeError, wrap::TlsRole};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;

/// 发送方向写排他策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteExclusion {
    /// 由包裹服务的 `supports_concurrent_io` 决定。
    #[default]
    Auto,
    /// 始终写排他。
    Always,
    /// 从不写排他。
    Never,
}

impl WriteExclusion {
    pub(crate) fn required(self, supports_concurrent_io: bool) -> bool {
        match self {
            WriteExclusion::Auto => !supports_concurrent_io,
            WriteExclusion::Always => true,
            WriteExclusion::Never => false,
        }
    }
}

/// 桥接器配置。
///
/// # 契约说明（What）
/// - `buffer_size`：每个循环单次读取的缓冲区字节数，必须大于 0；
/// - `handshake_timeout_ms` / `close_timeout_ms`：握手与关闭的时间上限，缺省分别为 10s / 5s，
///   显式写 `0` 表示不设上限；与调用方上下文的截止时间取较早者；
/// - `write_exclusion`：`auto | always | never`；
/// - `role`：`server | client`。
///
/// ```toml
/// buffer_size = 8192
/// handshake_timeout_ms = 3000
/// write_exclusion = "always"
/// role = "client"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub buffer_size: usize,
    pub handshake_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub write_exclusion: WriteExclusion,
    pub role: TlsRole,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            write_exclusion: WriteExclusion::Auto,
            role: TlsRole::Server,
        }
    }
}

impl BridgeConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, BridgeError> {
        let config: BridgeConfig = toml::from_str(raw).map_err(|err| BridgeError::Config {
            detail: err.to_string().into(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.buffer_size == 0 {
            return Err(BridgeError::Config {
                detail: "buffer_size must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout_ms = duration_to_ms(timeout);
        self
    }

    pub fn with_close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.close_timeout_ms = duration_to_ms(timeout);
        self
    }

    pub fn with_write_exclusion(mut self, write_exclusion: WriteExclusion) -> Self {
        self.write_exclusion = write_exclusion;
        self
    }

    pub fn with_role(mut self, role: TlsRole) -> Self {
        self.role = role;
        self
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        ms_to_duration(self.handshake_timeout_ms)
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        ms_to_duration(self.close_timeout_ms)
    }
}

fn ms_to_duration(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn duration_to_ms(timeout: Option<Duration>) -> u64 {
    // 亚毫秒的上限向上取整，避免被当成“不设上限”。
    timeout.map_or(0, |timeout| {
        u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            buffer_size = 4096
            write_exclusion = "always"
            role = "client"
            close_timeout_ms = 0
            "#,
        )
        .expect("valid config");
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.write_exclusion, WriteExclusion::Always);
        assert_eq!(config.role, TlsRole::Client);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.close_timeout(), None);
    }

    #[test]
    fn rejects_zero_buffer_and_unknown_keys() {
        let zero = BridgeConfig::from_toml_str("buffer_size = 0").expect_err("zero buffer");
        assert_eq!(zero.code(), "spark.tls_bridge.invalid_config");
        assert!(BridgeConfig::from_toml_str("buffer = 1").is_err());
    }

    #[test]
    fn exclusion_policy_follows_capability_only_in_auto() {
        assert!(WriteExclusion::Auto.required(false));
        assert!(!WriteExclusion::Auto.required(true));
        assert!(WriteExclusion::Always.required(true));
        assert!(!WriteExclusion::Never.required(false));
    }

    #[test]
    fn sub_millisecond_timeout_is_not_unbounded() {
        let config = BridgeConfig::default().with_handshake_timeout(Some(Duration::from_micros(10)));
        assert_eq!(config.handshake_timeout(), Some(Duration::from_millis(1)));
    }
}
