//! Protocol message decoding

use super::constants::{
    negotiation, tags, MAX_FRAME_LENGTH, NEGOTIATION_LEN, PLAINTEXT_REQUEST_CODE,
    TLS_REQUEST_CODE,
};
use super::message::{
    BackendMessage, ErrorReply, FrontendMessage, NegotiationRequest, NegotiationResponse,
};
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use std::io;

/// Decode a backend message from BytesMut without cloning
///
/// Decodes in-place and returns the number of bytes consumed. The caller must
/// advance the buffer after calling this.
///
/// # Returns
/// `Ok((msg, consumed))` - Message and number of bytes consumed
/// `Err(e)` - `UnexpectedEof` if the frame is incomplete, `InvalidData` if it is malformed
pub fn decode_message(data: &mut BytesMut) -> io::Result<(BackendMessage, usize)> {
    let (tag, body, consumed) = split_frame(data)?;

    let msg = match tag {
        tags::STATUS_REPLY => BackendMessage::Status(decode_json(body, "status reply")?),
        tags::ERROR_REPLY => BackendMessage::Error(decode_error_reply(body)?),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown backend message tag: {}", tag),
            ))
        }
    };

    Ok((msg, consumed))
}

/// Decode a frontend message (server side of the codec)
pub fn decode_frontend_message(data: &mut BytesMut) -> io::Result<(FrontendMessage, usize)> {
    let (tag, body, consumed) = split_frame(data)?;

    let msg = match tag {
        tags::HELLO => FrontendMessage::Hello(decode_json(body, "hello")?),
        tags::STATUS => FrontendMessage::Status,
        tags::TERMINATE => FrontendMessage::Terminate,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frontend message tag: {}", tag),
            ))
        }
    };

    Ok((msg, consumed))
}

/// Decode the 8-byte negotiation preamble
pub fn decode_negotiation(data: &[u8]) -> io::Result<NegotiationRequest> {
    if data.len() < NEGOTIATION_LEN as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "incomplete negotiation preamble",
        ));
    }

    let len = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if len != NEGOTIATION_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected negotiation length: {}", len),
        ));
    }

    match i32::from_be_bytes([data[4], data[5], data[6], data[7]]) {
        TLS_REQUEST_CODE => Ok(NegotiationRequest::Tls),
        PLAINTEXT_REQUEST_CODE => Ok(NegotiationRequest::Plaintext),
        code => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown negotiation request code: {:#010x}", code),
        )),
    }
}

/// Decode the single-byte negotiation response
pub fn decode_negotiation_response(byte: u8) -> io::Result<NegotiationResponse> {
    match byte {
        negotiation::ACCEPT_TLS => Ok(NegotiationResponse::AcceptTls),
        negotiation::TLS_UNAVAILABLE => Ok(NegotiationResponse::TlsUnavailable),
        negotiation::ACCEPT_PLAINTEXT => Ok(NegotiationResponse::AcceptPlaintext),
        negotiation::TLS_REQUIRED => Ok(NegotiationResponse::TlsRequired),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected negotiation response: {:#04x}", other),
        )),
    }
}

/// Validate the frame header and return (tag, body, bytes consumed)
fn split_frame(data: &BytesMut) -> io::Result<(u8, &[u8], usize)> {
    if data.len() < 5 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "incomplete message header",
        ));
    }

    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);

    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid message length {}", len),
        ));
    }

    let len = len as usize;
    if len > MAX_FRAME_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "message length {} exceeds maximum allowed {}",
                len, MAX_FRAME_LENGTH
            ),
        ));
    }

    if data.len() < len + 1 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "incomplete message body",
        ));
    }

    Ok((tag, &data[5..len + 1], len + 1))
}

fn decode_json<T: DeserializeOwned>(body: &[u8], what: &str) -> io::Result<T> {
    serde_json::from_slice(body).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed {} payload: {}", what, e),
        )
    })
}

fn decode_error_reply(data: &[u8]) -> io::Result<ErrorReply> {
    // The frame is complete here, so a short body is malformed rather than partial
    if data.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("error reply body of {} bytes has no error code", data.len()),
        ));
    }
    let code = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let message = String::from_utf8_lossy(&data[4..]).to_string();
    Ok(ErrorReply { code, message })
}
