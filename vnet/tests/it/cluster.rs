use std::{sync::Arc, time::Duration};

use vnet::{Engine, InProcessExchange, LinkProps, Weight};

use crate::{engine_with, eventually, frame, mac, weight};

const M1: &str = "m1";
const M2: &str = "m2";

/// Registers the same layout on an engine: n1 - b1 - r1 on m1, n2 - b2 - r2 on m2. Entities of
/// the other machine are placeholders.
async fn layout(engine: &Arc<Engine>) {
    engine.register_node("n1", M1, mac(1)).await.unwrap();
    engine.register_bridge("b1", M1).await.unwrap();
    engine.register_router("r1", M1).await.unwrap();
    engine.register_node("n2", M2, mac(2)).await.unwrap();
    engine.register_bridge("b2", M2).await.unwrap();
    engine.register_router("r2", M2).await.unwrap();

    let (node, bridge, router) =
        if engine.machine_id() == M1 { ("n1", "b1", "r1") } else { ("n2", "b2", "r2") };
    engine.connect_node_to_bridge(node, bridge, LinkProps::default()).await.unwrap();
    engine.connect_bridge_to_router(bridge, router, LinkProps::default()).await.unwrap();
}

async fn has_route(engine: &Arc<Engine>, router: &'static str, expected: Weight, to: u8) -> bool {
    engine.router_weights(router).await.unwrap().get(&mac(to)) == Some(&expected)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routers_on_two_machines_trade_routes_and_frames() {
    let _ = tracing_subscriber::fmt::try_init();

    let exchange = InProcessExchange::new();
    let e1 = engine_with(M1, exchange.clone()).await;
    let e2 = engine_with(M2, exchange.clone()).await;
    exchange.register(&e1);
    exchange.register(&e2);

    layout(&e1).await;
    layout(&e2).await;
    e1.add_machine(M2, e2.local_addr()).await;
    e2.add_machine(M1, e1.local_addr()).await;

    let props = LinkProps { latency: Duration::from_millis(10), ..weight(3) };
    e1.connect_router_to_router_remote("r1", "r2", props).await.unwrap();
    e2.connect_router_to_router_remote("r2", "r1", props).await.unwrap();

    let (a, b) = (e1.clone(), e2.clone());
    eventually(move || {
        let (a, b) = (a.clone(), b.clone());
        async move {
            has_route(&a, "r1", Weight::new("r2", 3), 2).await &&
                has_route(&b, "r2", Weight::new("r1", 3), 1).await
        }
    })
    .await;

    let n1 = e1.take_endpoint("n1").await.unwrap();
    let mut n2 = e2.take_endpoint("n2").await.unwrap();
    n1.tx.send(frame(mac(1), mac(2), b"across machines")).await.unwrap();

    let received =
        tokio::time::timeout(Duration::from_secs(2), n2.rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.src(), mac(1));
    assert_eq!(received.payload(), "across machines");
    assert!(e1.icm_stats().frames_out() >= 1);
    assert!(e2.icm_stats().frames_in() >= 1);

    e1.stop().await;
    e2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn machine_delay_is_taken_from_the_remote_half() {
    let exchange = InProcessExchange::new();
    let e1 = engine_with(M1, exchange.clone()).await;
    let e2 = engine_with(M2, exchange.clone()).await;
    exchange.register(&e1);
    exchange.register(&e2);

    layout(&e1).await;
    layout(&e2).await;
    e1.add_machine(M2, e2.local_addr()).await;
    e2.add_machine(M1, e1.local_addr()).await;
    e1.set_machine_delay(M2, Duration::from_millis(5)).await.unwrap();
    assert!(e1.set_machine_delay("m3", Duration::ZERO).await.is_err());

    e1.connect_router_to_router_remote("r1", "r2", weight(1)).await.unwrap();
    e2.connect_router_to_router_remote("r2", "r1", weight(1)).await.unwrap();

    let a = e1.clone();
    eventually(move || {
        let a = a.clone();
        async move { has_route(&a, "r1", Weight::new("r2", 1), 2).await }
    })
    .await;

    assert_eq!(e1.topology().await.machine_delay(M2), Some(Duration::from_millis(5)));

    e1.stop().await;
    e2.stop().await;
}

#[tokio::test]
async fn unreachable_peer_does_not_fail_propagation() {
    let exchange = InProcessExchange::new();
    let e1 = engine_with(M1, exchange.clone()).await;
    exchange.register(&e1);

    // A relay that accepts connections, standing in for a machine without an engine.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { while listener.accept().await.is_ok() {} });

    layout(&e1).await;
    e1.add_machine(M2, addr).await;
    e1.connect_router_to_router_remote("r1", "r2", weight(1)).await.unwrap();

    assert!(e1.router_weights("r1").await.unwrap().get(&mac(2)).is_none());
    e1.stop().await;
}
