//! Protocol message encoding

use super::constants::{negotiation, tags, NEGOTIATION_LEN, PLAINTEXT_REQUEST_CODE, TLS_REQUEST_CODE};
use super::message::{
    BackendMessage, ErrorReply, FrontendMessage, NegotiationRequest, NegotiationResponse,
};
use bytes::{BufMut, BytesMut};
use serde::Serialize;
use std::io;

/// Encode a frontend message into bytes
pub fn encode_message(msg: &FrontendMessage) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();

    match msg {
        FrontendMessage::Hello(meta) => encode_json(&mut buf, tags::HELLO, meta)?,
        FrontendMessage::Status => encode_empty(&mut buf, tags::STATUS),
        FrontendMessage::Terminate => encode_empty(&mut buf, tags::TERMINATE),
    }

    Ok(buf)
}

/// Encode a backend message into bytes
pub fn encode_backend_message(msg: &BackendMessage) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();

    match msg {
        BackendMessage::Status(status) => encode_json(&mut buf, tags::STATUS_REPLY, status)?,
        BackendMessage::Error(reply) => encode_error(&mut buf, reply),
    }

    Ok(buf)
}

/// Encode the 8-byte negotiation preamble
pub fn encode_negotiation(request: NegotiationRequest) -> BytesMut {
    let mut buf = BytesMut::with_capacity(NEGOTIATION_LEN as usize);
    buf.put_i32(NEGOTIATION_LEN);
    buf.put_i32(match request {
        NegotiationRequest::Tls => TLS_REQUEST_CODE,
        NegotiationRequest::Plaintext => PLAINTEXT_REQUEST_CODE,
    });
    buf
}

/// Encode the single-byte negotiation response
pub fn encode_negotiation_response(response: NegotiationResponse) -> u8 {
    match response {
        NegotiationResponse::AcceptTls => negotiation::ACCEPT_TLS,
        NegotiationResponse::TlsUnavailable => negotiation::TLS_UNAVAILABLE,
        NegotiationResponse::AcceptPlaintext => negotiation::ACCEPT_PLAINTEXT,
        NegotiationResponse::TlsRequired => negotiation::TLS_REQUIRED,
    }
}

fn encode_empty(buf: &mut BytesMut, tag: u8) {
    buf.put_u8(tag);
    buf.put_i32(4); // Length includes itself
}

fn encode_json<T: Serialize>(buf: &mut BytesMut, tag: u8, body: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(body)?;

    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_i32(0);

    buf.put_slice(&payload);

    fill_length(buf, len_pos)
}

fn encode_error(buf: &mut BytesMut, reply: &ErrorReply) {
    buf.put_u8(tags::ERROR_REPLY);
    let len_pos = buf.len();
    buf.put_i32(0);

    buf.put_i32(reply.code);
    buf.put(reply.message.as_bytes());

    let len = buf.len() - len_pos;
    buf[len_pos..len_pos + 4].copy_from_slice(&(len as i32).to_be_bytes());
}

fn fill_length(buf: &mut BytesMut, len_pos: usize) -> io::Result<()> {
    let len = buf.len() - len_pos;
    if len > super::constants::MAX_FRAME_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame length {} exceeds maximum", len),
        ));
    }
    buf[len_pos..len_pos + 4].copy_from_slice(&(len as i32).to_be_bytes());
    Ok(())
}
