//! Operator control client: a small CLI that talks the same control-message protocol a node
//! speaks to its peers, to drive deployment and module upload from the command line. Dials a
//! running node directly over the wire protocol rather than shelling out to anything.

use std::path::PathBuf;

use clap::Parser;
use estuary::codec::{decode_message, encode_message, ControlMessage};
use estuary::pipeline::PipelineSpec;
use estuary::transport::{write_frame, FrameReader, FrameType};
use tokio::net::TcpStream;

#[derive(Debug, Parser)]
#[command(name = "estuaryctl", about = "Control client for an estuary cluster node")]
enum Cli {
    /// Submit a pipeline deployment descriptor to a running node.
    Deploy {
        node_addr: String,
        pipeline_yaml: PathBuf,
    },
    /// Upload a module archive to a running node.
    UploadModule {
        node_addr: String,
        module_name: String,
        archive: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    match Cli::parse() {
        Cli::Deploy { node_addr, pipeline_yaml } => {
            let deployment = PipelineSpec::from_yaml_file(&pipeline_yaml)?;
            let mut stream = TcpStream::connect(&node_addr).await?;
            send_message(&mut stream, &ControlMessage::CreateDeployment { deployment }).await?;

            let (read_half, _write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            match reader.read_frame().await? {
                Some(frame) => match decode_message(&frame.payload)? {
                    ControlMessage::CreateDeploymentAck => println!("deployment accepted"),
                    other => println!("unexpected reply: {other:?}"),
                },
                None => println!("node closed the connection without replying"),
            }
        }

        Cli::UploadModule { node_addr, module_name, archive } => {
            let bytes = std::fs::read(&archive)?;
            let mut stream = TcpStream::connect(&node_addr).await?;
            send_message(&mut stream, &ControlMessage::InitModuleTransfer { module_name }).await?;

            let (mut read_half, mut write_half) = stream.into_split();
            let mut reader = FrameReader::new(&mut read_half);
            match reader.read_frame().await? {
                Some(frame) => match decode_message(&frame.payload)? {
                    ControlMessage::InitModuleTransferAccepted => {
                        write_frame(&mut write_half, FrameType::File, &bytes).await?;
                        match reader.read_frame().await? {
                            Some(ack_frame) => match decode_message(&ack_frame.payload)? {
                                ControlMessage::TransferFileAck => println!("module uploaded"),
                                other => println!("unexpected reply: {other:?}"),
                            },
                            None => println!("node closed the connection before acknowledging the file"),
                        }
                    }
                    ControlMessage::InitModuleTransferRejected => {
                        println!("node already has a module under that name");
                    }
                    other => println!("unexpected reply: {other:?}"),
                },
                None => println!("node closed the connection without replying"),
            }
        }
    }

    Ok(())
}

async fn send_message(stream: &mut TcpStream, msg: &ControlMessage) -> Result<(), Box<dyn std::error::Error>> {
    let encoded = encode_message(msg)?;
    write_frame(stream, FrameType::Object, &encoded).await?;
    Ok(())
}
