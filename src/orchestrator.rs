//! Cluster orchestrator: the set of active peer connections and the logic that keeps peers in
//! agreement about which modules and streams exist, plus recursive pipeline placement.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::ControlMessage;
use crate::error::Result;
use crate::module_repo::ModuleRepository;
use crate::peer::{Direction, PeerHandle};
use crate::pipeline::{PipelineMap, PipelineNode, PipelineSpec};
use crate::runtime::OperatorRuntime;
use crate::stream::StreamRepository;

pub struct ClusterOrchestrator {
    peers: DashMap<Uuid, (PeerHandle, Direction)>,
    module_repo: Arc<ModuleRepository>,
    stream_repo: Arc<StreamRepository>,
    operator_runtime: OperatorRuntime,
    /// Module name we asked a given peer (by id) to accept, awaiting its
    /// `InitModuleTransferAccepted` so the archive bytes can follow as a file frame.
    pending_outbound_transfers: DashMap<Uuid, String>,
}

impl ClusterOrchestrator {
    pub fn new(
        module_repo: Arc<ModuleRepository>,
        stream_repo: Arc<StreamRepository>,
        operator_runtime: OperatorRuntime,
    ) -> Self {
        Self {
            peers: DashMap::new(),
            module_repo,
            stream_repo,
            operator_runtime,
            pending_outbound_transfers: DashMap::new(),
        }
    }

    /// Registers a peer as a cluster member. Per this crate's resolution of the handshake open
    /// question, this is only called once the `connect_downstream` acknowledgment has been
    /// observed (by either side), never before. Announces every currently-known stream to the new
    /// peer and subscribes it to each (future local tuples are forwarded to it too).
    pub fn add_peer(&self, peer: PeerHandle, direction: Direction) {
        info!(peer = %peer.addr(), ?direction, "peer joined the cluster");
        self.peers.insert(peer.id(), (peer.clone(), direction));

        for stream in self.stream_repo.known_stream_handles() {
            peer.send(ControlMessage::CreateConnectorStream {
                stream_id: Some(stream.stream_id()),
                stream_alias: stream.stream_alias().map(|s| s.to_string()),
            });
            stream.add_subscriber(peer.clone());
        }
    }

    pub fn remove_peer(&self, peer: &PeerHandle) {
        self.peers.remove(&peer.id());
        self.stream_repo.remove_peer(peer);
        info!(peer = %peer.addr(), "peer left the cluster");
    }

    fn other_peers(&self, source: &PeerHandle) -> Vec<PeerHandle> {
        self.peers
            .iter()
            .filter(|e| e.value().0.id() != source.id())
            .map(|e| e.value().0.clone())
            .collect()
    }

    /// Broadcasts knowledge of `module_name` to every peer except `source` (the peer we learned
    /// it from, if any). Each recipient is sent `init_module_transfer`; the actual bytes follow
    /// once they accept.
    pub fn distribute_module(&self, source: Option<&PeerHandle>, module_name: &str) {
        let targets: Vec<PeerHandle> = match source {
            Some(src) => self.other_peers(src),
            None => self.peers.iter().map(|e| e.value().0.clone()).collect(),
        };
        for peer in targets {
            self.pending_outbound_transfers
                .insert(peer.id(), module_name.to_string());
            peer.send(ControlMessage::InitModuleTransfer {
                module_name: module_name.to_string(),
            });
        }
    }

    /// Called once a peer we distributed a module to replies `InitModuleTransferAccepted`: sends
    /// the archive bytes as the follow-on file frame. A `None` return means this peer had no
    /// transfer pending (e.g. a stray/duplicate accept) and nothing is sent.
    pub fn send_pending_module_file(&self, peer: &PeerHandle) {
        let Some((_, module_name)) = self.pending_outbound_transfers.remove(&peer.id()) else {
            warn!(peer = %peer.addr(), "accepted transfer with no pending module, ignoring");
            return;
        };
        match self.module_repo.archive_bytes(&module_name) {
            Ok(bytes) => peer.send_file(bytes),
            Err(e) => warn!(peer = %peer.addr(), module = %module_name, error = %e, "failed to read archive to forward"),
        }
    }

    /// Called on `InitModuleTransferRejected` to drop the bookkeeping for a transfer the peer
    /// declined (it already has a transfer for this name in flight on its side).
    pub fn cancel_pending_module_transfer(&self, peer: &PeerHandle) {
        self.pending_outbound_transfers.remove(&peer.id());
    }

    /// Broadcasts a newly-learned stream to every peer except the one we learned it from.
    pub fn distribute_stream(&self, source: &PeerHandle, stream_id: Uuid, stream_alias: Option<String>) {
        for peer in self.other_peers(source) {
            peer.send(ControlMessage::CreateConnectorStream {
                stream_id: Some(stream_id),
                stream_alias: stream_alias.clone(),
            });
        }
    }

    /// Entry point for a received `create_deployment`: recursively places operators and wires
    /// streams for the whole pipeline graph.
    pub fn create_deployment(&self, spec: &PipelineSpec) {
        info!(pipeline = %spec.name, "deploying pipeline");
        let known = spec.known_streams();
        self.deploy_pipelines(&known, &spec.pipelines, None);
    }

    /// Recursively walks a `pipelines` map. For each key: if it names an already-known input
    /// stream, resolve it; otherwise place an operator under that name and wire `source`'s output
    /// into a fresh stream feeding it. Chain (`PipelineNode::Chain`) recurses with the new output
    /// as the next stage's input; `PipelineNode::Leaves` wires the output directly to the named
    /// leaf streams.
    pub fn deploy_pipelines(&self, known_streams: &HashSet<String>, pipelines: &PipelineMap, source: Option<crate::stream::StreamHandle>) {
        for (key, node) in pipelines {
            let output_stream = if known_streams.contains(key) {
                Some(self.stream_repo.get_stream(None, Some(key.clone())).0)
            } else {
                match self.place_operator_blocking(key) {
                    Ok(operator) => match &source {
                        Some(src) => {
                            let out = self.stream_repo.new_stream();
                            src.connect_to_operator(operator, out.clone());
                            Some(out)
                        }
                        None => {
                            warn!(operator = %key, "placed operator with no input stream, skipping");
                            None
                        }
                    },
                    Err(e) => {
                        warn!(operator = %key, error = %e, "failed to place operator");
                        None
                    }
                }
            };

            match (node, &output_stream) {
                (PipelineNode::Chain(next), Some(out)) => {
                    self.deploy_pipelines(known_streams, next, Some(out.clone()));
                }
                (PipelineNode::Leaves(selectors), Some(out)) => {
                    for selector in selectors {
                        if known_streams.contains(selector) {
                            let (leaf, _) = self.stream_repo.get_stream(None, Some(selector.clone()));
                            out.connect_to_stream(leaf);
                        } else {
                            warn!(stream = %selector, "leaf stream not declared in `streams`, skipping");
                        }
                    }
                }
                (_, None) => {}
            }
        }
    }

    fn place_operator_blocking(&self, name: &str) -> Result<crate::runtime::OperatorHandle> {
        self.operator_runtime.place_operator(name)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_repo::FactoryRegistry;
    use crate::qos::QosMonitor;
    use std::time::Duration;

    fn orchestrator(tmp: &std::path::Path) -> ClusterOrchestrator {
        let registry = FactoryRegistry::new();
        let module_repo = Arc::new(ModuleRepository::new(tmp.join("apps"), registry));
        let qos = QosMonitor::new(tmp.join("stats"));
        let (runtime, _task_rx) = OperatorRuntime::new(module_repo.clone(), qos);
        let stream_repo = Arc::new(StreamRepository::with_runtime(runtime.clone()));
        ClusterOrchestrator::new(module_repo, stream_repo, runtime)
    }

    #[test]
    fn input_stream_key_resolves_without_placing_an_operator() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path());

        let mut known = HashSet::new();
        known.insert("source".to_string());

        let mut pipelines = PipelineMap::new();
        pipelines.insert("source".to_string(), PipelineNode::Leaves(vec!["sink".to_string()]));
        known.insert("sink".to_string());

        orch.deploy_pipelines(&known, &pipelines, None);
        assert!(orch.stream_repo.find_by_selector("source").is_some());
    }

    #[test]
    fn unplaceable_operator_is_skipped_without_panicking() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = orchestrator(tmp.path());

        let known = HashSet::new();
        let mut pipelines = PipelineMap::new();
        pipelines.insert("NoSuchOperator".to_string(), PipelineNode::Leaves(vec![]));

        orch.deploy_pipelines(&known, &pipelines, None);
    }

    struct PassThrough;
    impl crate::module_repo::OperatorLogic for PassThrough {
        fn call(&self, batch: Vec<crate::tuple::Tuple>) -> Vec<crate::tuple::Tuple> {
            batch
        }
    }

    struct Capture(Arc<std::sync::Mutex<Vec<crate::tuple::Tuple>>>);
    impl crate::module_repo::OperatorLogic for Capture {
        fn call(&self, batch: Vec<crate::tuple::Tuple>) -> Vec<crate::tuple::Tuple> {
            self.0.lock().unwrap().extend(batch.iter().cloned());
            batch
        }
    }

    /// Scenario 5 end to end: a deployment naming a known input stream, a placed operator, and a
    /// known leaf stream wires tuples from the input, through the operator, into the leaf, with
    /// the task dispatcher actually running the operators off the calling thread. A second
    /// non-batching fork on `alerts` stands in for a downstream consumer so the test can observe
    /// what the pipeline actually delivered there.
    #[test]
    fn deployed_pipeline_carries_a_tuple_from_input_through_operator_to_leaf() {
        use crate::tuple::Tuple;

        let tmp = tempfile::tempdir().unwrap();
        let captured = Arc::new(std::sync::Mutex::new(Vec::new()));

        let registry = FactoryRegistry::new();
        registry.register(
            "Detector",
            std::sync::Arc::new(|| Box::new(PassThrough) as Box<dyn crate::module_repo::OperatorLogic>),
        );
        registry.register(
            "Probe",
            std::sync::Arc::new({
                let captured = captured.clone();
                move || Box::new(Capture(captured.clone())) as Box<dyn crate::module_repo::OperatorLogic>
            }),
        );

        let archive_path = tmp.path().join("app.zip");
        {
            use std::io::Write;
            let file = std::fs::File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("module.yaml", options).unwrap();
            writer
                .write_all(
                    b"name: app\noperators:\n  - name: Detector\n    batch: false\n  - name: Probe\n    batch: false\n",
                )
                .unwrap();
            writer.finish().unwrap();
        }

        let module_repo = Arc::new(ModuleRepository::new(tmp.path().join("apps"), registry));
        module_repo.add_module("app".to_string(), archive_path);

        let qos = QosMonitor::new(tmp.path().join("stats"));
        let (runtime, task_rx) = OperatorRuntime::new(module_repo.clone(), qos.clone());
        let stream_repo = Arc::new(StreamRepository::with_runtime(runtime.clone()));
        let orch = ClusterOrchestrator::new(module_repo, stream_repo.clone(), runtime.clone());
        let _dispatcher = crate::worker::spawn_dispatcher(task_rx, qos);

        let mut pipelines = PipelineMap::new();
        pipelines.insert(
            "in".to_string(),
            PipelineNode::Chain({
                let mut next = PipelineMap::new();
                next.insert("Detector".to_string(), PipelineNode::Leaves(vec!["alerts".to_string()]));
                next
            }),
        );
        let spec = PipelineSpec {
            name: "detector-pipeline".to_string(),
            streams: vec!["in".to_string(), "alerts".to_string()],
            pipelines,
        };
        orch.create_deployment(&spec);

        let (in_stream, _) = stream_repo.get_stream(None, Some("in".to_string()));
        let (alerts, _) = stream_repo.get_stream(None, Some("alerts".to_string()));

        let probe = runtime.place_operator("Probe").unwrap();
        let sink = stream_repo.new_stream();
        alerts.connect_to_operator(probe, sink);

        in_stream.emit(Tuple::Int(99));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !captured.lock().unwrap().is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "tuple never reached alerts via Detector");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*captured.lock().unwrap(), vec![Tuple::Int(99)]);
    }
}
