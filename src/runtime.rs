//! Operator runtime: per-operator buffered input, batching semantics, and the single FIFO task
//! queue that the dedicated worker thread drains.
//!
//! One mutex per operator guards a queue of `(tuple, source_stream, sequence_no, callback)`
//! quadruples; whether appending a tuple enqueues the operator onto the task queue depends on the
//! batching flag and the queue's length at append time; a single worker thread executes
//! `execute_task` off the I/O loop so operator code never runs on the thread driving the sockets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::module_repo::{ModuleRepository, OperatorLogic};
use crate::qos::QosMonitor;
use crate::stream::StreamHandle;
use crate::tuple::Tuple;
use crate::error::Result;

pub type ResultCallback = Box<dyn FnOnce(Tuple) + Send>;

struct BufferedInput {
    tuple: Tuple,
    source_stream: StreamHandle,
    sequence_no: u64,
    callback: ResultCallback,
}

struct OperatorInner {
    id: Uuid,
    name: String,
    batch_mode: bool,
    logic: Box<dyn OperatorLogic>,
    buffer: Mutex<VecDeque<BufferedInput>>,
    batch_counter: AtomicU64,
}

/// Cheap, cloneable handle to a placed operator instance.
#[derive(Clone)]
pub struct OperatorHandle(Arc<OperatorInner>);

impl OperatorHandle {
    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Appends an input; returns whether this append should enqueue the operator onto the task
    /// queue. Batching operators dispatch only on the empty-to-non-empty transition; non-batching
    /// operators dispatch on every append.
    fn buffer_input(
        &self,
        tuple: Tuple,
        source_stream: StreamHandle,
        sequence_no: u64,
        callback: ResultCallback,
    ) -> bool {
        let mut buf = self.0.buffer.lock();
        let index = buf.len();
        buf.push_back(BufferedInput {
            tuple,
            source_stream,
            sequence_no,
            callback,
        });
        if self.0.batch_mode {
            index == 0
        } else {
            true
        }
    }

    /// Drains the buffer (the whole thing if batching, a single entry otherwise), runs the
    /// operator's logic, and invokes each input's callback with its corresponding result. Must
    /// only be called from the dispatcher's worker thread.
    pub fn execute_task(&self, qos: &QosMonitor) {
        let inputs: Vec<BufferedInput> = {
            let mut buf = self.0.buffer.lock();
            if self.0.batch_mode {
                std::mem::take(&mut *buf).into_iter().collect()
            } else {
                buf.pop_front().into_iter().collect()
            }
        };
        if inputs.is_empty() {
            return;
        }

        let batch_no = self.0.batch_counter.fetch_add(1, Ordering::Relaxed);
        for input in &inputs {
            qos.input_dispatched(
                self.0.id,
                self.0.name.clone(),
                input.source_stream.stream_id(),
                input.sequence_no,
                batch_no,
            );
        }

        let tuples: Vec<Tuple> = inputs.iter().map(|i| i.tuple.clone()).collect();
        let results = self.0.logic.call(tuples);
        debug_assert_eq!(results.len(), inputs.len(), "operator must return one result per input");

        for (input, result) in inputs.into_iter().zip(results) {
            (input.callback)(result);
        }
    }
}

struct OperatorRuntimeInner {
    module_repo: Arc<ModuleRepository>,
    qos: QosMonitor,
    operators: DashMap<String, OperatorHandle>,
    task_tx: flume::Sender<OperatorHandle>,
}

#[derive(Clone)]
pub struct OperatorRuntime(Arc<OperatorRuntimeInner>);

impl OperatorRuntime {
    pub fn new(
        module_repo: Arc<ModuleRepository>,
        qos: QosMonitor,
    ) -> (Self, flume::Receiver<OperatorHandle>) {
        let (task_tx, task_rx) = flume::unbounded();
        (
            Self(Arc::new(OperatorRuntimeInner {
                module_repo,
                qos,
                operators: DashMap::new(),
                task_tx,
            })),
            task_rx,
        )
    }

    /// Resolves `name` against the module repository and returns its (possibly freshly created)
    /// single instance for this node. Idempotent: placing the same name twice returns the same
    /// handle.
    pub fn place_operator(&self, name: &str) -> Result<OperatorHandle> {
        if let Some(existing) = self.0.operators.get(name) {
            return Ok(existing.clone());
        }
        let (factory, batch_mode) = self.0.module_repo.get_operator(name)?;
        let handle = OperatorHandle(Arc::new(OperatorInner {
            id: Uuid::new_v4(),
            name: name.to_string(),
            batch_mode,
            logic: factory(),
            buffer: Mutex::new(VecDeque::new()),
            batch_counter: AtomicU64::new(0),
        }));
        let entry = self
            .0
            .operators
            .entry(name.to_string())
            .or_insert(handle);
        Ok(entry.clone())
    }

    /// Buffers `tuple` for `operator`, notifies the QoS monitor, and enqueues the operator for
    /// dispatch if the buffering transition calls for it. `output` receives whatever the operator
    /// eventually returns.
    pub fn call_operator(
        &self,
        operator: &OperatorHandle,
        source: StreamHandle,
        sequence_no: u64,
        tuple: Tuple,
        output: StreamHandle,
    ) {
        let qos = self.0.qos.clone();
        let op_id = operator.id();
        let op_name = operator.name().to_string();
        let src_id = source.stream_id();

        let callback_op_name = op_name.clone();
        let callback: ResultCallback = Box::new(move |result| {
            qos.result_received(op_id, callback_op_name, src_id, sequence_no);
            output.emit(result);
        });

        let should_dispatch = operator.buffer_input(tuple, source, sequence_no, callback);
        self.0.qos.input_buffered(op_id, op_name, src_id, sequence_no);

        if should_dispatch {
            let _ = self.0.task_tx.send(operator.clone());
        }
    }

    pub fn task_sender(&self) -> flume::Sender<OperatorHandle> {
        self.0.task_tx.clone()
    }

    pub fn qos(&self) -> QosMonitor {
        self.0.qos.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_repo::FactoryRegistry;
    use crate::qos::QosMonitor;
    use crate::stream::StreamRepository;
    use std::sync::atomic::AtomicUsize;

    struct CountingEcho(Arc<AtomicUsize>);
    impl OperatorLogic for CountingEcho {
        fn call(&self, batch: Vec<Tuple>) -> Vec<Tuple> {
            self.0.fetch_add(batch.len(), Ordering::SeqCst);
            batch
        }
    }

    fn test_runtime(
        registry: FactoryRegistry,
        tmp: &std::path::Path,
    ) -> (OperatorRuntime, flume::Receiver<OperatorHandle>) {
        let module_repo = Arc::new(ModuleRepository::new(tmp.to_path_buf(), registry));
        let qos = QosMonitor::new(tmp.join("stats"));
        OperatorRuntime::new(module_repo, qos)
    }

    #[test]
    fn non_batching_operator_dispatches_every_append() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = FactoryRegistry::new();
        registry.register(
            "Echo",
            Arc::new({
                let calls = calls.clone();
                move || Box::new(CountingEcho(calls.clone())) as Box<dyn OperatorLogic>
            }),
        );

        let tmp = tempfile::tempdir().unwrap();
        // Placement requires a module export; fabricate a handle directly to test buffering
        // semantics in isolation from the archive/manifest machinery.
        let (runtime, task_rx) = test_runtime(registry, tmp.path());
        let handle = OperatorHandle(Arc::new(OperatorInner {
            id: Uuid::new_v4(),
            name: "Echo".to_string(),
            batch_mode: false,
            logic: Box::new(CountingEcho(calls.clone())),
            buffer: Mutex::new(VecDeque::new()),
            batch_counter: AtomicU64::new(0),
        }));

        let stream_repo = StreamRepository::new();
        let (src, _) = stream_repo.get_stream(None, Some("in".to_string()));
        let (out, _) = stream_repo.get_stream(None, Some("out".to_string()));

        runtime.call_operator(&handle, src.clone(), 0, Tuple::Int(1), out.clone());
        runtime.call_operator(&handle, src, 1, Tuple::Int(2), out);

        assert_eq!(task_rx.len(), 2, "non-batching operator enqueues on every append");
    }

    #[test]
    fn batching_operator_dispatches_only_on_empty_to_nonempty_transition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tmp = tempfile::tempdir().unwrap();
        let registry = FactoryRegistry::new();
        let (runtime, task_rx) = test_runtime(registry, tmp.path());

        let handle = OperatorHandle(Arc::new(OperatorInner {
            id: Uuid::new_v4(),
            name: "Batched".to_string(),
            batch_mode: true,
            logic: Box::new(CountingEcho(calls)),
            buffer: Mutex::new(VecDeque::new()),
            batch_counter: AtomicU64::new(0),
        }));

        let stream_repo = StreamRepository::new();
        let (src, _) = stream_repo.get_stream(None, Some("in".to_string()));
        let (out, _) = stream_repo.get_stream(None, Some("out".to_string()));

        runtime.call_operator(&handle, src.clone(), 0, Tuple::Int(1), out.clone());
        runtime.call_operator(&handle, src.clone(), 1, Tuple::Int(2), out.clone());
        runtime.call_operator(&handle, src, 2, Tuple::Int(3), out);

        assert_eq!(task_rx.len(), 1, "batching operator enqueues only once per drain cycle");
        let dispatched = task_rx.try_recv().unwrap();
        assert_eq!(dispatched.0.buffer.lock().len(), 3);
    }
}
