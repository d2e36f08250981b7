//! HTTP/1.x wire codec shared by the client and server connections.

mod headers;
mod line;
mod request;
mod response;
mod transfer;

pub use headers::{Framing, KeepAliveParams};
pub(crate) use request::{RequestHead, encode_request_head, read_request_head};
pub(crate) use response::{
    AfterStatus, ConnectionDirective, ResponseHead, determine_response_body_plan,
    encode_response_head, read_response_head,
};
pub(crate) use transfer::{read_body, write_body};

use http::Version;

use crate::body::Body;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    /// Delimited by the peer closing the connection.
    UntilClose,
}

impl BodyPlan {
    /// Framing for an outgoing body: a known length is sent fixed, anything else chunked.
    /// HTTP/1.0 peers cannot receive chunked data, so an unknown length there is `None`.
    pub fn for_outgoing(body: &Body, version: Version) -> Option<BodyPlan> {
        match body.content_length() {
            Some(0) => Some(BodyPlan::Empty),
            Some(length) => Some(BodyPlan::Fixed(length)),
            None if version == Version::HTTP_10 => None,
            None => Some(BodyPlan::Chunked),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, BodyPlan::Empty)
    }

    pub(crate) fn write_framing_headers(&self, buffer: &mut Vec<u8>) {
        match self {
            BodyPlan::Fixed(length) => {
                buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
            }
            BodyPlan::Chunked => buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
            BodyPlan::Empty | BodyPlan::UntilClose => {}
        }
    }
}
