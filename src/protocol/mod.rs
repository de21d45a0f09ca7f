//! Kafka protocol surface: record batch encoding and the RPC handlers.

pub mod handlers;
pub mod records;

pub use handlers::GateHandler;
pub use records::{
    decode_batch_records, decode_control_batch, encode_control_batch, encode_data_batch,
    parse_batch_info, BatchInfo, ControlMarker, ControlType, DecodedRecord,
};
