use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};

use crate::edgetun::tunnel::transport::{BoxedStream, Establisher};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("transport pool closed")]
    Closed,
    #[error("transport dial failed: {0:#}")]
    TransportDial(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of warm connections kept ready. Zero disables the refill task.
    pub capacity: usize,
    pub retry_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: 30,
            retry_interval: Duration::from_millis(500),
        }
    }
}

/// A warm supply of transport connections.
///
/// A background task keeps establishing connections and parks them in a
/// bounded channel. It never gives up on a failed establish: it sleeps for
/// `retry_interval` and tries again. Once the channel is full the task waits
/// for room, so every connection handed out is replaced in the background.
pub struct Pool {
    establisher: Arc<dyn Establisher>,
    ready: Mutex<mpsc::Receiver<BoxedStream>>,
    shutdown: watch::Sender<bool>,
    refill: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(establisher: Arc<dyn Establisher>, opts: PoolOptions) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(opts.capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let refill = (opts.capacity > 0).then(|| {
            tokio::spawn(refill_loop(
                establisher.clone(),
                tx,
                opts.retry_interval,
                shutdown_rx,
            ))
        });

        Arc::new(Self {
            establisher,
            ready: Mutex::new(rx),
            shutdown,
            refill: parking_lot::Mutex::new(refill),
        })
    }

    pub fn transport_name(&self) -> &'static str {
        self.establisher.name()
    }

    /// Hands out a connection: a warm one when available, otherwise one
    /// established on the spot. Never waits on the refill task.
    pub async fn dial(&self) -> Result<BoxedStream, PoolError> {
        if *self.shutdown.borrow() {
            return Err(PoolError::Closed);
        }

        if let Ok(mut ready) = self.ready.try_lock() {
            if let Ok(st) = ready.try_recv() {
                metrics::counter!("edgetun_pool_dials_total", "path" => "warm").increment(1);
                return Ok(st);
            }
        }

        let st = self
            .establisher
            .establish()
            .await
            .map_err(PoolError::TransportDial)?;
        metrics::counter!("edgetun_pool_dials_total", "path" => "cold").increment(1);
        Ok(st)
    }

    /// Stops the refill task and closes every parked connection.
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        if let Some(task) = self.refill.lock().take() {
            task.abort();
        }

        let mut ready = self.ready.lock().await;
        ready.close();
        let mut drained = 0usize;
        while let Ok(mut st) = ready.try_recv() {
            let _ = st.shutdown().await;
            drained += 1;
        }
        tracing::debug!(drained, "pool: closed");
    }
}

async fn refill_loop(
    establisher: Arc<dyn Establisher>,
    tx: mpsc::Sender<BoxedStream>,
    retry_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let res = tokio::select! {
            _ = shutdown.changed() => return,
            res = establisher.establish() => res,
        };

        match res {
            Ok(st) => {
                let sent = tokio::select! {
                    _ = shutdown.changed() => return,
                    sent = tx.send(st) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(
                    transport = establisher.name(),
                    err = %format!("{err:#}"),
                    retry_in = %humantime::format_duration(retry_interval),
                    "pool: dial failed; retrying"
                );
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    use super::*;

    /// Hands out duplex pipes and keeps the far ends for the test.
    pub struct DuplexEstablisher {
        pub attempts: AtomicUsize,
        /// Establish calls that fail before the first success.
        pub fail_first: usize,
        peers: mpsc::UnboundedSender<DuplexStream>,
    }

    impl DuplexEstablisher {
        pub fn new(fail_first: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    attempts: AtomicUsize::new(0),
                    fail_first,
                    peers: tx,
                }),
                rx,
            )
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Establisher for DuplexEstablisher {
        fn name(&self) -> &'static str {
            "duplex"
        }

        async fn establish(&self) -> anyhow::Result<BoxedStream> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("establish attempt {n} refused");
            }
            let (a, b) = tokio::io::duplex(64 * 1024);
            let _ = self.peers.send(b);
            Ok(Box::new(a))
        }
    }
}
