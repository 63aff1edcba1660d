//! A small distributed stream-processing cluster: nodes exchange modules (operator bundles),
//! wire up streams between placed operators, and forward tuples across the mesh as pipelines are
//! deployed onto it.

pub mod codec;
pub mod config;
pub mod error;
pub mod module_repo;
pub mod node;
pub mod orchestrator;
pub mod peer;
pub mod pipeline;
pub mod protocol;
pub mod qos;
pub mod runtime;
pub mod stream;
pub mod transport;
pub mod tuple;
pub mod worker;

pub use error::{EstuaryError, Result};
pub use node::Node;
