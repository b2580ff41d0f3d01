use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use vnet::{Engine, EngineOptions, Frame, LinkProps, MacAddr, NoExchange, RouteExchange};

mod cluster;
mod redirect;
mod routes;
mod shaping;

pub(crate) fn mac(b: u8) -> MacAddr {
    MacAddr([b; 6])
}

pub(crate) fn frame(src: MacAddr, dst: MacAddr, payload: &'static [u8]) -> Frame {
    Frame::new(src, dst, Bytes::from_static(payload))
}

pub(crate) fn weight(cost: u32) -> LinkProps {
    LinkProps { weight: cost, ..Default::default() }
}

pub(crate) async fn engine(machine: &str) -> Arc<Engine> {
    engine_with(machine, Arc::new(NoExchange)).await
}

pub(crate) async fn engine_with(machine: &str, exchange: Arc<dyn RouteExchange>) -> Arc<Engine> {
    Engine::new(EngineOptions::new(machine), exchange).await.unwrap()
}

/// Polls `cond` every 5ms, for at most a second.
pub(crate) async fn eventually<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
