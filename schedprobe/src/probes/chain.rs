//! Persistent pipeline of relay tasks.
//!
//! Each relay blocks on its predecessor's queue and forwards whatever it
//! receives to its successor. The pipeline is built once and a single token
//! is pushed through it per probe pass. Dropping the head sender makes every
//! relay exit in turn.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::{sync::mpsc, task::JoinHandle};

pub(crate) type Token = ();

/// Forwards tokens from `rx` to `tx` until either side is closed.
pub(crate) async fn forward(mut rx: mpsc::Receiver<Token>, tx: mpsc::Sender<Token>) {
    while let Some(token) = rx.recv().await {
        if tx.send(token).await.is_err() {
            break;
        }
    }
}

pub struct RelayChain {
    head: mpsc::Sender<Token>,
    tail: mpsc::Receiver<Token>,
    relays: Vec<JoinHandle<()>>,
}

impl RelayChain {
    /// Spawns `len` relay tasks linked head to tail.
    pub fn spawn(len: usize) -> Self {
        let (head, mut rx) = mpsc::channel(1);
        let mut relays = Vec::with_capacity(len);

        for _ in 0..len {
            let (tx, next) = mpsc::channel(1);
            relays.push(tokio::spawn(forward(rx, tx)));
            rx = next;
        }

        Self {
            head,
            tail: rx,
            relays,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.relays.len()
    }

    /// Pushes one token in at the head and waits for it at the tail.
    /// Returns the time elapsed since `since`.
    pub async fn relay(&mut self, since: Instant) -> Result<Duration> {
        self.head
            .send(())
            .await
            .context("relay chain head has closed")?;
        self.tail
            .recv()
            .await
            .context("relay chain tail has closed")?;
        Ok(Instant::now().duration_since(since))
    }

    pub async fn shutdown(self) {
        let Self { head, tail, relays } = self;
        drop(head);
        drop(tail);
        for relay in relays {
            let _ = relay.await;
        }
    }
}
