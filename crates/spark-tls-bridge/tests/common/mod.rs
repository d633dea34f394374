//! 集成测试共用的桥接器装配：两条 `tokio::io::duplex` 分别充当传输侧与应用侧，
//! 测试持有各自的对端。

#![allow(dead_code)]

use std::time::Duration;

use spark_tls_bridge::{BridgeConfig, DuplexChannel, StreamWrapper, TlsBridge};
use tokio::io::DuplexStream;

pub const PIPE_CAPACITY: usize = 64 * 1024;
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness<W: StreamWrapper> {
    pub bridge: TlsBridge<W>,
    /// 传输侧对端：写入的字节经接收循环出现在应用侧。
    pub transport_peer: DuplexStream,
    /// 应用侧对端：写入的字节经发送循环出现在传输侧。
    pub app_peer: DuplexStream,
}

pub fn harness<W>(wrapper: W, credential: W::Credential) -> anyhow::Result<Harness<W>>
where
    W: StreamWrapper,
{
    harness_with_config(wrapper, credential, BridgeConfig::default())
}

pub fn harness_with_config<W>(
    wrapper: W,
    credential: W::Credential,
    config: BridgeConfig,
) -> anyhow::Result<Harness<W>>
where
    W: StreamWrapper,
{
    let (transport_local, transport_peer) = tokio::io::duplex(PIPE_CAPACITY);
    let (app_local, app_peer) = tokio::io::duplex(PIPE_CAPACITY);
    let bridge = TlsBridge::builder(
        wrapper,
        credential,
        DuplexChannel::from_stream(transport_local),
        DuplexChannel::from_stream(app_local),
    )
    .with_config(config)
    .build()?;
    Ok(Harness {
        bridge,
        transport_peer,
        app_peer,
    })
}

/// 带超时的步骤，超时即视为测试失败。
pub async fn step<F, T>(what: &str, future: F) -> anyhow::Result<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(STEP_TIMEOUT, future)
        .await
        .map_err(|_| anyhow::anyhow!("{what} did not finish within {STEP_TIMEOUT:?}"))
}
