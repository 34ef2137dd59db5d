//! Shared helpers for relay integration tests.

#![allow(dead_code)]

mod client;
mod server;

pub use client::{next_data_message, recv_json, send_json, HubClient, WsRead, WsWrite};
pub use server::TestServer;

use std::time::Duration;

/// Poll `condition` every 10ms until it holds or five seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
