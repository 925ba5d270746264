use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::{sync::mpsc, task::JoinHandle};

use super::chain::{Token, forward};

/// Long-lived task that echoes every token from the one-slot send queue
/// back on the reply queue.
pub struct PingPongHelper {
    send: mpsc::Sender<Token>,
    reply: mpsc::Receiver<Token>,
    helper: JoinHandle<()>,
}

impl PingPongHelper {
    pub fn spawn() -> Self {
        let (send, rx) = mpsc::channel(1);
        let (tx, reply) = mpsc::channel(1);
        Self {
            send,
            reply,
            helper: tokio::spawn(forward(rx, tx)),
        }
    }

    /// Sends one token and waits for the echo.
    ///
    /// Returns `(buffered_send, ping_pong, t3)`: the enqueue time measured
    /// from `since`, the echo time measured from the end of the enqueue, and
    /// the instant the echo was observed.
    pub async fn round_trip(&mut self, since: Instant) -> Result<(Duration, Duration, Instant)> {
        self.send
            .send(())
            .await
            .context("ping-pong helper has exited")?;
        let t2 = Instant::now();

        self.reply
            .recv()
            .await
            .context("ping-pong helper has exited")?;
        let t3 = Instant::now();

        Ok((t2.duration_since(since), t3.duration_since(t2), t3))
    }

    pub async fn shutdown(self) {
        let Self {
            send,
            reply,
            helper,
        } = self;
        drop(send);
        drop(reply);
        let _ = helper.await;
    }
}
