//! MrTAP: the hash-chained handshake/data protocol run over a datachannel
//! (spec §3, §4.H).

mod engine;
mod pipeline;
mod types;

pub use engine::{hash_message, MrtapEngine};
pub use pipeline::{DaemonMrtapPeer, DEFAULT_PIPELINE_CAP, DEFAULT_RECOVERY_CAP};
pub use types::{DataAckMessage, DataMessage, MrtapMessage, SchemaVersion, SynAckMessage, SynMessage};
