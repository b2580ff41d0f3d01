use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use vnet::{Engine, EngineOptions, LinkProps, NoExchange, Shaper, ShaperKind, TopologyOptions};
use vnet_wire::frame;

use crate::{eventually, mac};

const M1: &str = "m1";

async fn lan(dir: &std::path::Path) -> Arc<Engine> {
    let options = EngineOptions::new(M1).topology(TopologyOptions::default().socket_dir(dir));
    let engine = Engine::new(options, Arc::new(NoExchange)).await.unwrap();

    engine.register_bridge("b1", M1).await.unwrap();
    engine.register_node("n1", M1, mac(1)).await.unwrap();
    engine.register_node("n2", M1, mac(2)).await.unwrap();
    engine.connect_node_to_bridge("n1", "b1", LinkProps::default()).await.unwrap();
    engine.connect_node_to_bridge("n2", "b1", LinkProps::default()).await.unwrap();
    engine
}

/// Whether a client is attached to the socket of the link from `from` to `to`.
async fn client_attached(engine: &Engine, from: &str, to: &str) -> bool {
    let topology = engine.topology().await;
    match topology.link(from, to).map(|link| link.shaper()) {
        Some(Shaper::Sniff(shaper)) => shaper.socket().stats().is_connected(),
        Some(Shaper::Intercept(shaper)) => shaper.socket().stats().is_connected(),
        _ => false,
    }
}

async fn wait_for_client(engine: &Arc<Engine>) {
    let engine = engine.clone();
    eventually(move || {
        let engine = engine.clone();
        async move { client_attached(&engine, "n1", "b1").await }
    })
    .await;
}

#[tokio::test]
async fn sniffer_sees_copies_of_traffic() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir().unwrap();
    let engine = lan(dir.path()).await;
    let n1 = engine.take_endpoint("n1").await.unwrap();
    let mut n2 = engine.take_endpoint("n2").await.unwrap();

    let path = engine.sniff_link("n1", "b1").await.unwrap();
    assert_eq!(path, dir.path().join("n1-b1.sniff"));

    let stream = UnixStream::connect(&path).await.unwrap();
    let mut sniffer = Framed::new(stream, frame::Codec::new());
    wait_for_client(&engine).await;

    n1.tx.send(crate::frame(mac(1), mac(2), b"observed")).await.unwrap();

    let copy = sniffer.next().await.unwrap().unwrap();
    assert_eq!(copy.dst(), mac(2));
    assert_eq!(copy.payload(), "observed");
    assert_eq!(n2.rx.recv().await.unwrap().payload(), "observed");

    // Frames written by a sniffer are discarded.
    sniffer.send(crate::frame(mac(1), mac(2), b"injected")).await.unwrap();
    n1.tx.send(crate::frame(mac(1), mac(2), b"second")).await.unwrap();
    assert_eq!(n2.rx.recv().await.unwrap().payload(), "second");

    engine.restore_link("n1", "b1").await.unwrap();
    assert!(!path.exists());
    assert_eq!(engine.topology().await.link("n1", "b1").unwrap().kind(), ShaperKind::Network);

    let stats = engine.link_stats("n1", "b1").await.unwrap();
    assert_eq!(stats.mirrored(), 2);
    engine.stop().await;
}

#[tokio::test]
async fn interceptor_replaces_traffic() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir().unwrap();
    let engine = lan(dir.path()).await;
    let n1 = engine.take_endpoint("n1").await.unwrap();
    let mut n2 = engine.take_endpoint("n2").await.unwrap();

    let path = engine.intercept_link("n1", "b1").await.unwrap();
    assert_eq!(path, dir.path().join("n1-b1.intercept"));

    let stream = UnixStream::connect(&path).await.unwrap();
    let mut interceptor = Framed::new(stream, frame::Codec::new());
    wait_for_client(&engine).await;

    n1.tx.send(crate::frame(mac(1), mac(2), b"original")).await.unwrap();
    let captured = interceptor.next().await.unwrap().unwrap();
    assert_eq!(captured.payload(), "original");

    interceptor.send(crate::frame(mac(1), mac(2), b"rewritten")).await.unwrap();
    let delivered =
        tokio::time::timeout(Duration::from_secs(1), n2.rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.payload(), "rewritten");
    assert!(n2.rx.try_recv().is_err());

    let stats = engine.link_stats("n1", "b1").await.unwrap();
    assert_eq!(stats.intercepted(), 1);

    engine.stop().await;
    assert!(!path.exists());
}
