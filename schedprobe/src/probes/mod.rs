//! Scheduler latency probes.
//!
//! One probe pass runs four measurements back to back on the sampling task:
//! - **Oversleep**: how much later than requested a timer sleep wakes up.
//! - **Buffered send**: enqueue into a one-slot queue with a ready consumer.
//! - **Ping-pong**: the consumer relaying that token back to us.
//! - **Chain**: a token relayed through a persistent pipeline of tasks.
//!
//! The helper tasks behind the last three are spawned once and reused by
//! every pass, so steady-state relay latency is measured rather than task
//! creation cost.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::info;

pub mod chain;
pub mod oversleep;
pub mod ping_pong;

use chain::RelayChain;
use ping_pong::PingPongHelper;

/// One probe pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Wall-clock time the pass began.
    pub start: DateTime<Utc>,
    pub oversleep: Duration,
    pub buffered_send: Duration,
    pub ping_pong: Duration,
    pub chain: Duration,
}

/// Owns the long-lived helper tasks and runs probe passes.
///
/// Must be created inside a tokio runtime.
pub struct ProbeSet {
    sleep: Duration,
    ping_pong: PingPongHelper,
    chain: RelayChain,
}

impl ProbeSet {
    pub fn spawn(sleep: Duration, chain_length: usize) -> Self {
        let probes = Self {
            sleep,
            ping_pong: PingPongHelper::spawn(),
            chain: RelayChain::spawn(chain_length),
        };
        info!(
            "Probe set started (sleep={:?}, chain_length={})",
            sleep, chain_length
        );
        probes
    }

    pub fn chain_length(&self) -> usize {
        self.chain.len()
    }

    /// Runs all four measurements in sequence and returns the sample.
    ///
    /// Fails only if a helper task has gone away.
    pub async fn sample(&mut self) -> Result<Sample> {
        let start = Utc::now();
        let t0 = Instant::now();

        let t1 = oversleep::sleep_until_woken(self.sleep).await;
        let oversleep = oversleep::excess(t1.duration_since(t0), self.sleep);

        let (buffered_send, ping_pong, t3) = self.ping_pong.round_trip(t1).await?;
        let chain = self.chain.relay(t3).await?;

        Ok(Sample {
            start,
            oversleep,
            buffered_send,
            ping_pong,
            chain,
        })
    }

    /// Stops every helper task and waits for them to exit.
    pub async fn shutdown(self) {
        self.ping_pong.shutdown().await;
        self.chain.shutdown().await;
        info!("Probe set stopped");
    }
}
