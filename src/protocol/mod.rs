//! Control-message dispatch: the logic behind each [`ControlMessage`] variant, split out of
//! `node.rs` so the per-connection read loop stays a thin frame-to-message pump.

use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::ControlMessage;
use crate::node::Node;
use crate::peer::PeerHandle;

/// Per-connection state the dispatch logic needs to carry between messages. Currently just the
/// module name a `InitModuleTransfer` accepted on this connection, awaiting the file frame that
/// follows it.
#[derive(Default)]
pub struct ConnectionState {
    pending_module_name: Option<String>,
}

pub async fn dispatch(node: &Arc<Node>, peer: &PeerHandle, state: &mut ConnectionState, msg: ControlMessage) {
    match msg {
        ControlMessage::ConnectDownstream => {
            node.orchestrator.add_peer(peer.clone(), peer.direction());
            peer.send(ControlMessage::ConnectDownstreamAck);
        }
        ControlMessage::ConnectDownstreamAck => {
            node.orchestrator.add_peer(peer.clone(), peer.direction());
        }

        ControlMessage::CreateDeployment { deployment } => {
            node.orchestrator.create_deployment(&deployment);
            peer.send(ControlMessage::CreateDeploymentAck);
        }
        ControlMessage::CreateDeploymentAck => {
            info!(peer = %peer.addr(), "peer acknowledged deployment");
        }

        ControlMessage::InitModuleTransfer { module_name } => {
            // Rejected only when a transfer on *this connection* is already in flight; an
            // already-known module name is still accepted (the new archive simply replaces it).
            if state.pending_module_name.is_some() {
                peer.send(ControlMessage::InitModuleTransferRejected);
            } else {
                state.pending_module_name = Some(module_name);
                peer.send(ControlMessage::InitModuleTransferAccepted);
            }
        }
        ControlMessage::InitModuleTransferAccepted => {
            info!(peer = %peer.addr(), "peer accepted module transfer, sending archive");
            node.orchestrator.send_pending_module_file(peer);
        }
        ControlMessage::InitModuleTransferRejected => {
            info!(peer = %peer.addr(), "peer rejected module transfer, already has one in flight");
            node.orchestrator.cancel_pending_module_transfer(peer);
        }
        ControlMessage::TransferFileAck => {
            info!(peer = %peer.addr(), "peer acknowledged module file");
        }

        ControlMessage::CreateConnectorStream { stream_id, stream_alias } => {
            let (handle, created) = node.stream_repo.create_connector_stream(peer, stream_id, stream_alias.clone());
            peer.send(ControlMessage::CreateConnectorStreamAck {
                stream_id: handle.stream_id(),
                stream_alias: stream_alias.clone(),
            });
            // Only re-broadcast when this call actually interned a new stream, so a stream
            // migrating across an already-connected mesh doesn't echo forever.
            if created {
                node.orchestrator.distribute_stream(peer, handle.stream_id(), stream_alias);
            }
        }
        ControlMessage::CreateConnectorStreamAck { stream_id, .. } => {
            info!(peer = %peer.addr(), %stream_id, "peer acknowledged stream");
        }

        ControlMessage::Subscribe { stream_alias } => {
            node.stream_repo.subscribe(stream_alias.clone(), peer.clone());
            peer.send(ControlMessage::SubscribeAck { stream_alias });
        }
        ControlMessage::SubscribeAck { stream_alias } => {
            info!(peer = %peer.addr(), stream = %stream_alias, "subscribe acknowledged");
        }
        ControlMessage::SubscribeError { stream_alias } => {
            warn!(peer = %peer.addr(), stream = %stream_alias, "peer rejected subscribe");
        }

        ControlMessage::DataTuple { stream_selector, tuple } => {
            if !node.stream_repo.tuple_received(&stream_selector, tuple) {
                warn!(peer = %peer.addr(), stream = %stream_selector, "data tuple for unknown stream");
            }
        }
    }
}

/// Handles a raw file frame: only meaningful right after an accepted `InitModuleTransfer` on the
/// same connection.
pub async fn handle_file(node: &Arc<Node>, peer: &PeerHandle, state: &mut ConnectionState, bytes: Vec<u8>) {
    let Some(module_name) = state.pending_module_name.take() else {
        warn!(peer = %peer.addr(), "received a file frame with no pending module transfer");
        return;
    };

    let archive_dir = node.config.app_repo_path.join("archives");
    if let Err(e) = std::fs::create_dir_all(&archive_dir) {
        warn!(error = %e, "failed to create module archive directory");
        return;
    }
    let archive_path = archive_dir.join(format!("{module_name}.zip"));
    if let Err(e) = std::fs::write(&archive_path, &bytes) {
        warn!(error = %e, module = %module_name, "failed to persist received module archive");
        return;
    }

    node.module_repo.add_module(module_name.clone(), archive_path);
    info!(module = %module_name, peer = %peer.addr(), "module received and registered");
    node.orchestrator.distribute_module(Some(peer), &module_name);
    peer.send(ControlMessage::TransferFileAck);
}
