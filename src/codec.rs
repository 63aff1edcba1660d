//! The multiplexed peer protocol's control messages and their wire encoding.
//!
//! Every control message is one variant of a single Rust enum: the variant discriminant is the
//! `op`, request and reply are distinct variants (so there is nothing optional to check at
//! dispatch time), and bincode's variant tag makes the encoding self-describing on its own.

use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::PipelineSpec;
use crate::tuple::Tuple;

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ControlMessage {
    /// Sent by the dialing side immediately after the TCP connection is established.
    ConnectDownstream,
    /// Acknowledges a `ConnectDownstream`; receiving this is the canonical membership event.
    ConnectDownstreamAck,

    CreateDeployment { deployment: PipelineSpec },
    CreateDeploymentAck,

    InitModuleTransfer { module_name: String },
    InitModuleTransferAccepted,
    InitModuleTransferRejected,

    /// Acknowledges the file frame that follows an accepted `InitModuleTransfer`.
    TransferFileAck,

    /// Announces or migrates a stream to a peer. Either identifier may be absent on first use;
    /// the receiver interns by whichever is present.
    CreateConnectorStream {
        stream_id: Option<Uuid>,
        stream_alias: Option<String>,
    },
    CreateConnectorStreamAck {
        stream_id: Uuid,
        stream_alias: Option<String>,
    },

    Subscribe {
        stream_alias: String,
    },
    SubscribeAck {
        stream_alias: String,
    },
    SubscribeError {
        stream_alias: String,
    },

    DataTuple {
        stream_selector: String,
        tuple: Tuple,
    },
}

pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(msg, bincode_config())?)
}

pub fn decode_message(bytes: &[u8]) -> Result<ControlMessage> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode_config())?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn data_tuple_round_trips() {
        let msg = ControlMessage::DataTuple {
            stream_selector: "alerts".to_string(),
            tuple: Tuple::Int(42),
        };
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn create_connector_stream_with_absent_fields_round_trips() {
        let msg = ControlMessage::CreateConnectorStream {
            stream_id: None,
            stream_alias: Some("video".to_string()),
        };
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn deployment_with_nested_pipeline_round_trips() {
        let yaml = "name: p\nstreams: []\npipelines:\n  Source:\n    - sink\n";
        let deployment = PipelineSpec::from_yaml(yaml).unwrap();
        let msg = ControlMessage::CreateDeployment { deployment };
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decoding_garbage_returns_an_error_instead_of_panicking() {
        let garbage = vec![0xff; 8];
        assert!(decode_message(&garbage).is_err());
    }

    #[test]
    fn map_valued_tuples_round_trip() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), Tuple::Int(1));
        let msg = ControlMessage::DataTuple {
            stream_selector: "s".to_string(),
            tuple: Tuple::Map(map.into_iter().collect()),
        };
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }
}
