//! Wire protocol
//!
//! Covers only what connection establishment and status probing need: the
//! negotiation preamble, the hello exchange and status probes.

pub mod constants;
mod decode;
mod encode;
mod message;

pub use decode::{
    decode_frontend_message, decode_message, decode_negotiation, decode_negotiation_response,
};
pub use encode::{
    encode_backend_message, encode_message, encode_negotiation, encode_negotiation_response,
};
pub use message::{
    BackendMessage, ClientMetadata, ErrorReply, FrontendMessage, NegotiationRequest,
    NegotiationResponse, ServerStatus,
};
