//! Coordinator (component H).
//!
//! Grounded in `src/main/python/pgshovel/consumer/worker.py`'s
//! `Coordinator` class: a control `Queue` carries `(operation, arguments,
//! response_future)` tuples for `subscribe`/`unsubscribe`, and the main
//! loop alternates between draining that control queue and taking
//! non-blocking from each subscribed consumer's batch queue, calling
//! `finish(connection)` on whatever it gets. The `connection` there is a
//! single shared database connection used to call `pgq.finish_batch` for
//! every consumer this Coordinator owns, which is why subscribe/unsubscribe
//! must run through the same task as the drain loop rather than locking.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::consumer::PendingBatch;
use crate::error::RelsetError;
use crate::pgq;

enum Control {
    Subscribe {
        set_name: String,
        batches: mpsc::Receiver<PendingBatch>,
        reply: oneshot::Sender<Result<(), RelsetError>>,
    },
    Unsubscribe {
        set_name: String,
        reply: oneshot::Sender<Result<(), RelsetError>>,
    },
    Stop,
}

/// Handle used by callers to subscribe/unsubscribe a Consumer's batch
/// stream with a running [`Coordinator::run`] loop.
#[derive(Clone)]
pub struct CoordinatorHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl CoordinatorHandle {
    pub async fn subscribe(
        &self,
        set_name: impl Into<String>,
        batches: mpsc::Receiver<PendingBatch>,
    ) -> Result<(), RelsetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(Control::Subscribe { set_name: set_name.into(), batches, reply: reply_tx })
            .map_err(|_| RelsetError::Cancelled)?;
        reply_rx.await.map_err(|_| RelsetError::Cancelled)?
    }

    pub async fn unsubscribe(&self, set_name: impl Into<String>) -> Result<(), RelsetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(Control::Unsubscribe { set_name: set_name.into(), reply: reply_tx })
            .map_err(|_| RelsetError::Cancelled)?;
        reply_rx.await.map_err(|_| RelsetError::Cancelled)?
    }

    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }
}

/// Owns the single shared connection used to `finish_batch` on behalf of
/// every Consumer subscribed to this database. One Coordinator per
/// member database.
pub struct Coordinator {
    control_rx: mpsc::UnboundedReceiver<Control>,
    control_tx: mpsc::UnboundedSender<Control>,
    subscriptions: HashMap<String, mpsc::Receiver<PendingBatch>>,
}

impl Coordinator {
    pub fn new() -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self { control_rx, control_tx, subscriptions: HashMap::new() }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle { control: self.control_tx.clone() }
    }

    /// Connect to `dsn`, returning the shared [`Client`] that this
    /// Coordinator and every Consumer it supervises must use for all
    /// their SQL, plus the task driving the connection (abort it once the
    /// Coordinator and its Consumers have all stopped).
    pub async fn connect(dsn: &str) -> Result<(Arc<Client>, tokio::task::JoinHandle<()>), RelsetError> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls)
            .await
            .map_err(|e| RelsetError::ConnectionFailed { dsn: dsn.to_string(), cause: e.to_string() })?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "coordinator connection driver exited with error");
            }
        });
        Ok((Arc::new(client), connection_task))
    }

    /// Run the drain loop over `client` until [`CoordinatorHandle::stop`]
    /// is called. On each iteration: drain every pending control message
    /// non-blocking, then poll each subscribed set's batch channel
    /// non-blocking and `finish_batch` whatever arrives. `client` is the
    /// same connection shared with every Consumer subscribed here — see
    /// [`Coordinator::connect`].
    pub async fn run(&mut self, client: Arc<Client>) -> Result<(), RelsetError> {
        self.drain_loop(&client).await
    }

    async fn drain_loop(&mut self, client: &Client) -> Result<(), RelsetError> {
        loop {
            while let Ok(msg) = self.control_rx.try_recv() {
                if self.handle_control(msg) {
                    return Ok(());
                }
            }

            let mut dead_sets = Vec::new();
            let mut processed_any = false;
            for (set_name, batches) in self.subscriptions.iter_mut() {
                match batches.try_recv() {
                    Ok(pending) => {
                        processed_any = true;
                        if let Err(e) = pgq::finish_batch(client, pending.handle).await {
                            warn!(set = %set_name, error = %e, "failed to finish batch");
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {}
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        info!(set = %set_name, "consumer disconnected, dropping subscription");
                        dead_sets.push(set_name.clone());
                    }
                }
            }
            for set_name in dead_sets {
                self.subscriptions.remove(&set_name);
            }

            if !processed_any {
                tokio::select! {
                    msg = self.control_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if self.handle_control(msg) {
                                    return Ok(());
                                }
                            }
                            None => return Ok(()),
                        }
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                }
            }
        }
    }

    /// Returns `true` if the loop should stop.
    fn handle_control(&mut self, msg: Control) -> bool {
        match msg {
            Control::Subscribe { set_name, batches, reply } => {
                self.subscriptions.insert(set_name, batches);
                let _ = reply.send(Ok(()));
                false
            }
            Control::Unsubscribe { set_name, reply } => {
                self.subscriptions.remove(&set_name);
                let _ = reply.send(Ok(()));
                false
            }
            Control::Stop => true,
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_then_stop_via_handle() {
        let mut coordinator = Coordinator::new();
        let handle = coordinator.handle();
        let (_tx, rx) = mpsc::channel(1);

        let join = tokio::spawn(async move {
            coordinator.drain_loop_for_test(rx).await;
        });

        handle.stop();
        join.await.unwrap();
    }
}

#[cfg(test)]
impl Coordinator {
    async fn drain_loop_for_test(&mut self, batches: mpsc::Receiver<PendingBatch>) {
        self.subscriptions.insert("test".into(), batches);
        loop {
            while let Ok(msg) = self.control_rx.try_recv() {
                if self.handle_control(msg) {
                    return;
                }
            }
            tokio::select! {
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(msg) => { if self.handle_control(msg) { return; } }
                        None => return,
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
            }
        }
    }
}
