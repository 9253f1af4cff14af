//! The single-lane flush queue.
//!
//! Every `write_to_disk` becomes one job on this queue; the pump task
//! applies jobs strictly in enqueue order, so two flushes can never
//! interleave and completion order matches submission order.

use std::sync::Arc;

use mirach_db::{BulkOp, DbError, DbResult, DocStore};
use tokio::sync::{mpsc, oneshot};
use tracing::*;

pub struct FlushJob {
    pub ops: Vec<BulkOp>,
    pub done: oneshot::Sender<DbResult<()>>,
}

#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<FlushJob>,
}

impl WriterHandle {
    /// Enqueues a batch and waits for it to land.
    pub async fn submit(&self, ops: Vec<BulkOp>) -> DbResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let job = FlushJob { ops, done: done_tx };
        if self.tx.send(job).await.is_err() {
            return Err(DbError::Io(std::io::Error::other("writer queue closed")));
        }
        done_rx
            .await
            .map_err(|_| DbError::Io(std::io::Error::other("writer queue dropped job")))?
    }
}

/// Spawns the pump; the returned future is the task body, the handle is
/// for submitters.  The pump drains remaining jobs before exiting once the
/// handle side closes.
pub fn start_writer_task(
    store: Arc<dyn DocStore>,
) -> (WriterHandle, impl std::future::Future<Output = anyhow::Result<()>>) {
    let (tx, mut rx) = mpsc::channel::<FlushJob>(64);
    let task = async move {
        while let Some(job) = rx.recv().await {
            let n = job.ops.len();
            let res = store.bulk_write(job.ops).await;
            if let Err(e) = &res {
                error!(err = %e, ops = %n, "state flush failed");
            } else {
                trace!(ops = %n, "state flush applied");
            }
            let _ = job.done.send(res);
        }
        info!("writer queue drained, exiting");
        Ok(())
    };
    (WriterHandle { tx }, task)
}
