//! Node bootstrap and the per-connection I/O loop.
//!
//! One single-threaded `tokio` runtime drives every socket, while operator execution and QoS CSV
//! output happen on their own dedicated threads.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::module_repo::{FactoryRegistry, ModuleRepository};
use crate::orchestrator::ClusterOrchestrator;
use crate::peer::{spawn_peer, Direction};
use crate::protocol::{self, ConnectionState};
use crate::qos::QosMonitor;
use crate::runtime::OperatorRuntime;
use crate::stream::StreamRepository;
use crate::transport::{FrameReader, FrameType};
use crate::error::Result;

const PARENT_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct Node {
    pub node_id: Uuid,
    pub config: NodeConfig,
    pub module_repo: Arc<ModuleRepository>,
    pub stream_repo: Arc<StreamRepository>,
    pub operator_runtime: OperatorRuntime,
    pub orchestrator: Arc<ClusterOrchestrator>,
    pub qos: QosMonitor,
}

impl Node {
    pub fn new(config: NodeConfig, registry: FactoryRegistry) -> Arc<Self> {
        let qos = QosMonitor::new(config.data_path.clone());
        let module_repo = Arc::new(ModuleRepository::new(config.app_repo_path.clone(), registry));
        let (operator_runtime, task_rx) = OperatorRuntime::new(module_repo.clone(), qos.clone());
        crate::worker::spawn_dispatcher(task_rx, operator_runtime.qos());

        let stream_repo = Arc::new(StreamRepository::with_runtime(operator_runtime.clone()));
        let orchestrator = Arc::new(ClusterOrchestrator::new(
            module_repo.clone(),
            stream_repo.clone(),
            operator_runtime.clone(),
        ));

        Arc::new(Self {
            node_id: Uuid::new_v4(),
            config,
            module_repo,
            stream_repo,
            operator_runtime,
            orchestrator,
            qos,
        })
    }

    /// Builds the single-threaded runtime and runs the node until the listener fails.
    pub fn run(config: NodeConfig, registry: FactoryRegistry) -> Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(Self::new(config, registry).start())
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let port = self.config.root_server_port;
        self.clone().bind_and_serve("0.0.0.0", port).await?;

        if let Some(parent) = self.config.parent_addr() {
            let node = self.clone();
            tokio::spawn(async move { node.dial_parent(parent).await });
        }

        std::future::pending::<()>().await;
        Ok(())
    }

    /// Binds a listener and spawns the accept loop as a background task, returning the resolved
    /// address immediately. Exposed beyond `start` so tests can bind an ephemeral port (`:0`) and
    /// learn what it resolved to.
    pub async fn bind_and_serve(self: Arc<Self>, host: &str, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "node listening");
        tokio::spawn(self.accept_loop(listener));
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    let node = self.clone();
                    tokio::spawn(async move { node.handle_connection(socket, addr, Direction::Ingress).await });
                }
                Err(e) => {
                    error!(error = %e, "accept loop failed, node is no longer accepting connections");
                    break;
                }
            }
        }
    }

    /// Dials `addr` until connected, retrying on a fixed 5-second schedule.
    pub async fn connect_to(self: Arc<Self>, addr: String) {
        self.dial_parent(addr).await
    }

    async fn dial_parent(self: Arc<Self>, addr: String) {
        loop {
            match TcpStream::connect(&addr).await {
                Ok(socket) => {
                    let remote = socket.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
                    self.clone().handle_connection(socket, remote, Direction::Egress).await;
                    return;
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "failed to dial parent, retrying in 5s");
                    tokio::time::sleep(PARENT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, addr: SocketAddr, direction: Direction) {
        let (read_half, write_half) = socket.into_split();
        let peer = spawn_peer(addr, direction, write_half);

        if direction == Direction::Egress {
            peer.send(crate::codec::ControlMessage::ConnectDownstream);
        }

        let mut state = ConnectionState::default();
        let mut reader = FrameReader::new(read_half);

        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => match frame.frame_type {
                    FrameType::Object => match crate::codec::decode_message(&frame.payload) {
                        Ok(msg) => protocol::dispatch(&self, &peer, &mut state, msg).await,
                        Err(e) => warn!(peer = %addr, error = %e, "dropping malformed object frame"),
                    },
                    FrameType::File => {
                        protocol::handle_file(&self, &peer, &mut state, frame.payload.to_vec()).await;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %addr, error = %e, "connection read error");
                    break;
                }
            }
        }

        self.orchestrator.remove_peer(&peer);
    }
}

pub fn register_default_node(config: NodeConfig, registry: FactoryRegistry) -> Result<()> {
    if let Err(e) = Node::run(config, registry) {
        error!(error = %e, "node exited with an error");
        return Err(e);
    }
    Ok(())
}
