use std::time::Duration;

use tokio::time::Instant;
use vnet::LinkProps;

use crate::{engine, frame, mac};

const M1: &str = "m1";

#[tokio::test(start_paused = true)]
async fn latency_accumulates_across_links() {
    let engine = engine(M1).await;
    engine.register_bridge("b1", M1).await.unwrap();
    engine.register_node("n1", M1, mac(1)).await.unwrap();
    engine.register_node("n2", M1, mac(2)).await.unwrap();

    // Each connection delays frames by half its latency in each direction.
    let props = LinkProps { latency: Duration::from_millis(40), ..Default::default() };
    engine.connect_node_to_bridge("n1", "b1", props).await.unwrap();
    engine.connect_node_to_bridge("n2", "b1", props).await.unwrap();

    let n1 = engine.take_endpoint("n1").await.unwrap();
    let mut n2 = engine.take_endpoint("n2").await.unwrap();

    let start = Instant::now();
    n1.tx.send(frame(mac(1), mac(2), b"delayed")).await.unwrap();
    n2.rx.recv().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(40));

    engine.stop().await;
}

#[tokio::test]
async fn lossy_link_counts_drops() {
    let engine = engine(M1).await;
    engine.register_bridge("b1", M1).await.unwrap();
    engine.register_node("n1", M1, mac(1)).await.unwrap();
    engine.register_node("n2", M1, mac(2)).await.unwrap();

    let lossy = LinkProps { drop_rate: 1.0, ..Default::default() };
    engine.connect_node_to_bridge("n1", "b1", lossy).await.unwrap();
    engine.connect_node_to_bridge("n2", "b1", LinkProps::default()).await.unwrap();

    let n1 = engine.take_endpoint("n1").await.unwrap();
    let mut n2 = engine.take_endpoint("n2").await.unwrap();
    for _ in 0..10 {
        n1.tx.send(frame(mac(1), mac(2), b"lost")).await.unwrap();
    }

    let stats = engine.link_stats("n1", "b1").await.unwrap();
    crate::eventually(|| {
        let stats = stats.clone();
        async move { stats.dropped_loss() == 10 }
    })
    .await;
    assert_eq!(stats.frames_tx(), 0);
    assert!(n2.rx.try_recv().is_err());

    engine.stop().await;
}

#[tokio::test]
async fn invalid_props_are_rejected() {
    let engine = engine(M1).await;
    engine.register_bridge("b1", M1).await.unwrap();
    engine.register_node("n1", M1, mac(1)).await.unwrap();

    let props = LinkProps { drop_rate: 1.5, ..Default::default() };
    assert!(engine.connect_node_to_bridge("n1", "b1", props).await.is_err());
    assert!(engine.topology().await.node("n1").unwrap().bridge().is_none());
}
