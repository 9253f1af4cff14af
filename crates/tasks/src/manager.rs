use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::*;

use crate::shutdown::{ShutdownGuard, ShutdownSignal};

/// Terminal report from a critical task.
#[derive(Debug)]
pub struct TaskError {
    pub name: String,
    pub error: String,
}

/// Owns the shutdown channel and watches critical tasks.  A critical task
/// erroring or panicking takes the whole node down.
pub struct TaskManager {
    handle: Handle,
    shutdown: ShutdownSignal,
    shutdown_rx: watch::Receiver<bool>,
    err_tx: mpsc::UnboundedSender<TaskError>,
    err_rx: mpsc::UnboundedReceiver<TaskError>,
}

impl TaskManager {
    pub fn new(handle: Handle) -> Self {
        let (shutdown, shutdown_rx) = ShutdownSignal::new();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        Self {
            handle,
            shutdown,
            shutdown_rx,
            err_tx,
            err_rx,
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            handle: self.handle.clone(),
            shutdown: self.shutdown.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
            err_tx: self.err_tx.clone(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Installs the ctrl-c listener that flips the shutdown signal.
    pub fn start_signal_listeners(&self) {
        let shutdown = self.shutdown.clone();
        self.handle.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, shutting down");
                shutdown.send();
            }
        });
    }

    /// Blocks until shutdown is signalled or a critical task dies, then
    /// gives remaining tasks `grace` to finish draining.  Returns the
    /// first task error, if any.
    pub fn monitor(mut self, grace: Option<Duration>) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let first_err = self.handle.block_on(async {
            tokio::select! {
                _ = shutdown_rx.wait_for(|v| *v) => None,
                err = self.err_rx.recv() => {
                    // Channel can't close while we hold a sender.
                    let err = err.expect("tasks: error channel");
                    self.shutdown.send();
                    Some(err)
                }
            }
        });

        if let Some(grace) = grace {
            // Give tasks a moment to observe the signal and drain.
            std::thread::sleep(grace);
        }

        match first_err {
            Some(e) => Err(anyhow::anyhow!("critical task {} failed: {}", e.name, e.error)),
            None => Ok(()),
        }
    }
}

/// Cloneable spawner handed to subsystem init code.
#[derive(Clone)]
pub struct TaskExecutor {
    handle: Handle,
    shutdown: ShutdownSignal,
    shutdown_rx: watch::Receiver<bool>,
    err_tx: mpsc::UnboundedSender<TaskError>,
}

impl TaskExecutor {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    fn guard(&self) -> ShutdownGuard {
        ShutdownGuard::new(self.shutdown_rx.clone())
    }

    fn report(&self, name: &str, res: Result<anyhow::Result<()>, String>) {
        match res {
            Ok(Ok(())) => debug!(task = %name, "task exited cleanly"),
            Ok(Err(e)) => {
                error!(task = %name, err = %e, "critical task failed");
                let _ = self.err_tx.send(TaskError {
                    name: name.to_owned(),
                    error: e.to_string(),
                });
            }
            Err(panic) => {
                error!(task = %name, err = %panic, "critical task panicked");
                let _ = self.err_tx.send(TaskError {
                    name: name.to_owned(),
                    error: panic,
                });
            }
        }
    }

    /// Spawns a blocking critical task on its own thread.
    pub fn spawn_critical<F>(&self, name: &'static str, task: F)
    where
        F: FnOnce(ShutdownGuard) -> anyhow::Result<()> + Send + 'static,
    {
        let guard = self.guard();
        let this = self.clone();
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task(guard)))
                    .map_err(|p| panic_message(&p));
                this.report(name, res);
            })
            .expect("tasks: spawn thread");
    }

    /// Spawns an async critical task on the runtime.
    pub fn spawn_critical_async<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = self.clone();
        self.handle.spawn(async move {
            let res = std::panic::AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|p| panic_message(&p));
            this.report(name, res);
        });
    }

    /// Variant for async tasks that want to watch the shutdown guard.
    pub fn spawn_critical_async_with_shutdown<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(ShutdownGuard) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let guard = self.guard();
        self.spawn_critical_async(name, task(guard));
    }
}

fn panic_message(p: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_triggers_shutdown() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let manager = TaskManager::new(rt.handle().clone());
        let exec = manager.executor();

        exec.spawn_critical_async("boom", async { Err(anyhow::anyhow!("kaput")) });

        let res = manager.monitor(Some(Duration::from_millis(10)));
        assert!(res.is_err());
    }

    #[test]
    fn test_signal_ends_monitor() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let manager = TaskManager::new(rt.handle().clone());
        let signal = manager.shutdown_signal();

        let exec = manager.executor();
        exec.spawn_critical_async("idle", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        signal.send();
        manager
            .monitor(Some(Duration::from_millis(10)))
            .expect("test: clean shutdown");
    }
}
