//! 写排他：加密流声明不支持读写并发时，发送方向的写入与接收方向的挂起读取从不重叠。
//!
//! # 教案式说明
//! - **Why**：部分 TLS 实现共享同一个记录层状态，读写并发会破坏它；
//! - **How**：`PassthroughWrapper` 在流外套一层探针，写入或刷新时若有读取挂起就记一次违规；
//! - **What**：双向持续传输后违规计数必须为零，且读写都确实发生过。

mod common;

use anyhow::Context;
use common::{harness, harness_with_config, step};
use spark_tls_bridge::{
    BridgeConfig, CallContext, LoopState, WriteExclusion, test_stubs::PassthroughWrapper,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const ROUNDS: usize = 64;

fn payload(round: usize) -> Vec<u8> {
    (0..97).map(|i| (round * 31 + i) as u8).collect()
}

async fn exchange(h: common::Harness<PassthroughWrapper>) -> anyhow::Result<()> {
    let ctx = CallContext::default();
    h.bridge.start(&ctx).await.context("start")?;

    let (mut app_read, mut app_write) = tokio::io::split(h.app_peer);
    let (mut transport_read, mut transport_write) = tokio::io::split(h.transport_peer);

    let outbound = tokio::spawn(async move {
        for round in 0..ROUNDS {
            app_write.write_all(&payload(round)).await?;
        }
        anyhow::Ok(app_write)
    });
    let inbound = tokio::spawn(async move {
        for round in (0..ROUNDS).rev() {
            transport_write.write_all(&payload(round)).await?;
        }
        anyhow::Ok(transport_write)
    });

    let expected_out: Vec<u8> = (0..ROUNDS).flat_map(payload).collect();
    let expected_in: Vec<u8> = (0..ROUNDS).rev().flat_map(payload).collect();
    let mut seen_out = vec![0u8; expected_out.len()];
    let mut seen_in = vec![0u8; expected_in.len()];
    let (out, inb) = tokio::join!(
        step("drain transport", transport_read.read_exact(&mut seen_out)),
        step("drain application", app_read.read_exact(&mut seen_in)),
    );
    out??;
    inb??;
    assert_eq!(seen_out, expected_out);
    assert_eq!(seen_in, expected_in);

    let _app_write = outbound.await??;
    let _transport_write = inbound.await??;
    step("stop", h.bridge.stop(&ctx)).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn exclusive_mode_never_writes_during_a_pending_read() -> anyhow::Result<()> {
    let wrapper = PassthroughWrapper::new().without_concurrent_io();
    let stats = wrapper.probe_stats();
    let h = harness(wrapper, ())?;
    exchange(h).await?;

    assert_eq!(stats.violations(), 0, "write overlapped a pending read");
    assert!(stats.writes() > 0);
    assert!(stats.reads() > 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_exclusion_applies_even_to_concurrent_streams() -> anyhow::Result<()> {
    let wrapper = PassthroughWrapper::new();
    let stats = wrapper.probe_stats();
    let h = harness_with_config(
        wrapper,
        (),
        BridgeConfig::default().with_write_exclusion(WriteExclusion::Always),
    )?;
    exchange(h).await?;
    assert_eq!(stats.violations(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_mode_moves_data_without_pausing_receiver() -> anyhow::Result<()> {
    let wrapper = PassthroughWrapper::new();
    let h = harness(wrapper, ())?;
    let ctx = CallContext::default();
    h.bridge.start(&ctx).await?;
    let receiver = h.bridge.receiver()?;

    let states = receiver.clone();
    let observer = tokio::spawn(async move {
        // 非排他模式下只有显式调用才会暂停接收方向。
        let wait = CallContext::default().with_timeout(Some(std::time::Duration::from_millis(200)));
        states.wait_for_state(&wait, LoopState::is_pausing).await
    });

    let mut app_peer = h.app_peer;
    let mut transport_peer = h.transport_peer;
    app_peer.write_all(b"no exclusion").await?;
    let mut buf = [0u8; 12];
    step("transport read", transport_peer.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"no exclusion");

    assert!(observer.await?.is_err(), "receiver paused without exclusion");
    assert_eq!(receiver.state(), LoopState::Running);
    h.bridge.stop(&ctx).await?;
    Ok(())
}
