//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::time::Duration;

use event_persister::config::PersisterConfig;
use serde_json::json;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn order_payload(event_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": event_id,
        "symbol": "BTC/USDT",
        "timestamp": 1708123456789000000i64,
        "order_id": format!("ord-{}", event_id),
        "account_id": "acc-1",
        "side": "BUY",
        "order_type": "LIMIT",
        "status": "NEW",
        "price": "50000.25",
        "quantity": "1.5",
    }))
    .unwrap()
}

pub fn match_payload(event_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": event_id,
        "symbol": "ETH/USDC",
        "timestamp": 1708123456789000000i64,
        "match_id": format!("m-{}", event_id),
        "maker_order_id": "ord-1",
        "taker_order_id": "ord-2",
        "side": "SELL",
        "price": "3100",
        "quantity": "2",
    }))
    .unwrap()
}

/// Config with a given batch size and a batch age long enough that only
/// size, revocation or shutdown trigger a flush.
pub fn config(max_batch_size: usize) -> PersisterConfig {
    let mut config = PersisterConfig::default();
    config.sink.max_batch_size = max_batch_size;
    config.sink.max_batch_age_ms = 60_000;
    config
}

/// Poll `condition` until it holds, failing the test after 60s of
/// (usually paused) time.
pub async fn eventually(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
