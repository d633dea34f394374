//! 顺序性质：任意分块的字节序列穿过桥接器后按原序、无增无减地到达对端。
//!
//! # 教案式说明
//! - **Why**：循环在暂停、部分写入与刷新之间反复切换，任何偏移量错误都会表现为乱序或重复；
//! - **How**：`proptest` 生成分块与缓冲区大小，每个用例独立构建多线程运行时；
//! - **What**：两个方向同时传输，且传输中穿插暂停/恢复。

mod common;

use std::time::Duration;

use common::harness_with_config;
use proptest::prelude::*;
use spark_tls_bridge::{BridgeConfig, CallContext, WriteExclusion, test_stubs::PassthroughWrapper};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn chunks() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..256), 1..24)
}

async fn run_case(
    outbound: Vec<Vec<u8>>,
    inbound: Vec<Vec<u8>>,
    buffer_size: usize,
    exclusion: WriteExclusion,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let h = harness_with_config(
        PassthroughWrapper::new(),
        (),
        BridgeConfig::default()
            .with_buffer_size(buffer_size)
            .with_write_exclusion(exclusion),
    )?;
    let ctx = CallContext::default();
    h.bridge.start(&ctx).await?;
    let receiver = h.bridge.receiver()?;

    let out_len: usize = outbound.iter().map(Vec::len).sum();
    let in_len: usize = inbound.iter().map(Vec::len).sum();
    let (mut app_read, mut app_write) = tokio::io::split(h.app_peer);
    let (mut transport_read, mut transport_write) = tokio::io::split(h.transport_peer);

    let writers = tokio::spawn(async move {
        for i in 0..outbound.len().max(inbound.len()) {
            if let Some(chunk) = outbound.get(i) {
                app_write.write_all(chunk).await?;
            }
            if let Some(chunk) = inbound.get(i) {
                transport_write.write_all(chunk).await?;
            }
        }
        anyhow::Ok((app_write, transport_write))
    });
    let pauser = tokio::spawn(async move {
        let ctx = CallContext::default();
        for _ in 0..4 {
            if let Ok(resume) = receiver.pause(&ctx).await {
                tokio::task::yield_now().await;
                resume.resume();
            }
        }
    });

    let mut seen_out = vec![0u8; out_len];
    let mut seen_in = vec![0u8; in_len];
    let (out, inb) = tokio::join!(
        transport_read.read_exact(&mut seen_out),
        app_read.read_exact(&mut seen_in),
    );
    out?;
    inb?;
    let _ends = writers.await??;
    pauser.await?;
    h.bridge.stop(&ctx).await?;
    Ok((seen_out, seen_in))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn bytes_arrive_in_order_in_both_directions(
        outbound in chunks(),
        inbound in chunks(),
        buffer_size in 1usize..512,
        exclusive in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("构建 tokio 运行时失败");
        let exclusion = if exclusive { WriteExclusion::Always } else { WriteExclusion::Never };
        let expected_out: Vec<u8> = outbound.concat();
        let expected_in: Vec<u8> = inbound.concat();

        let (seen_out, seen_in) = runtime
            .block_on(async {
                tokio::time::timeout(
                    Duration::from_secs(10),
                    run_case(outbound, inbound, buffer_size, exclusion),
                )
                .await
            })
            .expect("用例超时")
            .expect("桥接传输失败");

        prop_assert_eq!(seen_out, expected_out);
        prop_assert_eq!(seen_in, expected_in);
    }
}
