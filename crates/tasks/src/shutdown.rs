use tokio::sync::watch;

/// Sender half of the shutdown channel.  Cloneable; any holder can bring
/// the node down.
#[derive(Clone)]
pub struct ShutdownSignal(watch::Sender<bool>);

impl ShutdownSignal {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), rx)
    }

    /// Flags shutdown.  All guards observe it on their next check.
    pub fn send(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiver half handed to every task.  Tasks poll it between units of
/// work or await it in a select.
#[derive(Clone)]
pub struct ShutdownGuard(watch::Receiver<bool>);

impl ShutdownGuard {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    pub fn should_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been signalled.
    pub async fn wait_for_shutdown(&mut self) {
        // An error here means the sender is gone, which is shutdown too.
        let _ = self.0.wait_for(|v| *v).await;
    }
}
