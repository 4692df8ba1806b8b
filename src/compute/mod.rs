//! Compute worker subsystem
//!
//! Everything between the orchestrator and the GPU worker process:
//! the frame codec, the wire message payloads, the request/response
//! multiplexer, and worker lifecycle management.

pub mod frame;
pub mod lifecycle;
pub mod mux;
pub mod protocol;

pub use frame::{Frame, FRAME_MAGIC, HEADER_LEN, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
pub use lifecycle::{spawn_worker, ComputeConfig, ComputeWorker};
pub use mux::Multiplexer;
pub use protocol::{
    wire_seed, ErrorResponse, GenerateRequest, GenerateResponse, ERROR_RESPONSE,
    GENERATE_REQUEST, GENERATE_RESPONSE, SD35_MAX_PROMPT_LEN,
};
