//! The operator task dispatcher: a single dedicated OS thread that drains the FIFO task queue and
//! runs operator code off the async I/O loop. One worker is enough: the task queue only ever
//! needs to serialize one operator's execution at a time.

use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::qos::QosMonitor;
use crate::runtime::OperatorHandle;

/// Spawns the dispatcher thread. The thread exits cleanly once every `flume::Sender` for
/// `task_rx` has been dropped (node shutdown).
pub fn spawn_dispatcher(task_rx: flume::Receiver<OperatorHandle>, qos: QosMonitor) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("estuary-task-dispatcher".to_string())
        .spawn(move || {
            while let Ok(operator) = task_rx.recv() {
                debug!(operator = operator.name(), queue_len = task_rx.len(), "dispatching operator task");
                operator.execute_task(&qos);
            }
            info!("task dispatcher exiting: queue closed");
        })
        .expect("failed to spawn task dispatcher thread")
}
