use vnet::{EngineError, LinkProps, TopologyError, Weight};

use crate::{engine, mac, weight};

const M1: &str = "m1";

#[tokio::test]
async fn routes_follow_router_connections() {
    let _ = tracing_subscriber::fmt::try_init();
    let engine = engine(M1).await;
    let n1: vnet::MacAddr = "AA:AA:AA:AA:AA:AA".parse().unwrap();

    engine.register_node("n1", M1, n1).await.unwrap();
    engine.register_bridge("b1", M1).await.unwrap();
    engine.register_router("r1", M1).await.unwrap();
    engine.register_router("r2", M1).await.unwrap();

    engine.connect_node_to_bridge("n1", "b1", LinkProps::default()).await.unwrap();
    engine.connect_bridge_to_router("b1", "r1", LinkProps::default()).await.unwrap();

    let r1 = engine.router_weights("r1").await.unwrap();
    assert_eq!(r1.get(&n1), Some(&Weight::new("r1", 0)));
    assert!(engine.router_weights("r2").await.unwrap().is_empty());

    engine.connect_router_to_router_local("r1", "r2", weight(5)).await.unwrap();
    let r2 = engine.router_weights("r2").await.unwrap();
    assert_eq!(r2.get(&n1), Some(&Weight::new("r1", 5)));

    engine.disconnect_routers("r1", "r2").await.unwrap();
    assert!(engine.router_weights("r2").await.unwrap().get(&n1).is_none());
    assert_eq!(engine.router_weights("r1").await.unwrap().get(&n1), Some(&Weight::new("r1", 0)));

    engine.stop().await;
}

#[tokio::test]
async fn node_joining_later_reaches_every_router() {
    let engine = engine(M1).await;
    for r in ["r1", "r2", "r3"] {
        engine.register_router(r, M1).await.unwrap();
    }
    engine.register_bridge("b3", M1).await.unwrap();
    engine.register_node("n3", M1, mac(3)).await.unwrap();

    engine.connect_router_to_router_local("r1", "r2", weight(2)).await.unwrap();
    engine.connect_router_to_router_local("r2", "r3", weight(4)).await.unwrap();
    engine.connect_bridge_to_router("b3", "r3", LinkProps::default()).await.unwrap();

    // Joining a bridge that already has a router propagates from that router.
    engine.connect_node_to_bridge("n3", "b3", LinkProps::default()).await.unwrap();

    assert_eq!(engine.router_weights("r3").await.unwrap()[&mac(3)], Weight::new("r3", 0));
    assert_eq!(engine.router_weights("r2").await.unwrap()[&mac(3)], Weight::new("r3", 4));
    assert_eq!(engine.router_weights("r1").await.unwrap()[&mac(3)], Weight::new("r2", 6));

    // A shortcut is picked up when propagated again.
    engine.connect_router_to_router_local("r1", "r3", weight(1)).await.unwrap();
    assert_eq!(engine.router_weights("r1").await.unwrap()[&mac(3)], Weight::new("r3", 1));

    engine.stop().await;
}

#[tokio::test]
async fn forget_then_propagate_rebuilds_tables() {
    let engine = engine(M1).await;
    engine.register_router("r1", M1).await.unwrap();
    engine.register_router("r2", M1).await.unwrap();
    engine.register_bridge("b1", M1).await.unwrap();
    engine.register_node("n1", M1, mac(1)).await.unwrap();
    engine.connect_node_to_bridge("n1", "b1", LinkProps::default()).await.unwrap();
    engine.connect_bridge_to_router("b1", "r1", LinkProps::default()).await.unwrap();
    engine.connect_router_to_router_local("r1", "r2", weight(3)).await.unwrap();

    engine.forget_routes("r2").await.unwrap();
    assert!(engine.router_weights("r2").await.unwrap().is_empty());

    engine.propagate("r1").await.unwrap();
    assert_eq!(engine.router_weights("r2").await.unwrap()[&mac(1)], Weight::new("r1", 3));

    engine.stop().await;
}

#[tokio::test]
async fn errors_surface_from_topology() {
    let engine = engine(M1).await;
    engine.register_router("r1", M1).await.unwrap();

    let err = engine.register_router("r1", M1).await.unwrap_err();
    assert!(matches!(err, EngineError::Topology(TopologyError::AlreadyExists(_))));
}
