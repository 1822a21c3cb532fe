use tokio::{
    select,
    signal::{
        ctrl_c,
        unix::{signal, SignalKind},
    },
    sync::{broadcast, mpsc},
};

use crate::misc::Take;

#[derive(Debug)]
pub struct ShutdownHandle {
    #[allow(unused)]
    inner: mpsc::Sender<()>,
    listener: broadcast::Receiver<()>,
    trigger: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.listener.recv().await;
    }

    pub fn trigger_shutdown(&mut self) {
        let _ = self.trigger.send(());
    }
}

pub struct Shutdown {
    tx: Take<mpsc::Sender<()>>,
    rx: mpsc::Receiver<()>,
    trigger: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (trigger, _) = broadcast::channel(1);
        Self {
            tx: Take::new(tx),
            rx,
            trigger,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: self.tx.clone(),
            listener: self.trigger.subscribe(),
            trigger: self.trigger.clone(),
        }
    }

    /// Blocks until every outstanding [`ShutdownHandle`] has been dropped.
    pub async fn wait_for_completion(&mut self) {
        drop(self.tx.take());
        self.rx.recv().await;
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.trigger.send(());
    }
}

/// Turn SIGINT and SIGTERM into a shutdown trigger.
pub async fn trap_signals(mut handle: ShutdownHandle) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        select! {
            res = ctrl_c() => {
                if res.is_err() {
                    error!("failed to listen for ctrl_c signal - triggering shutdown");
                }
            }
            _ = term.recv() => {}
            _ = handle.wait_for_shutdown() => return,
        }
        info!("shutdown requested");
        handle.trigger_shutdown();
    });
}
