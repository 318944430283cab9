//! WebSocket protocol core (RFC 6455): opcodes, frames and the opening
//! handshake.

pub mod frame;
pub mod handshake;
pub mod opcode;

pub use frame::{Frame, apply_mask};
pub use handshake::{
    HandshakeRejection, HandshakeRequest, HandshakeResponse, WS_GUID, compute_accept_key,
    generate_key, validate_origin,
};
pub use opcode::OpCode;
