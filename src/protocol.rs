//! Protocol Definition Module
//!
//! This module defines the PUT/GET exchange carried over the framing codec:
//! - Typed requests and responses with newline-separated text headers
//! - The client-side exchange state machine
//! - Filename validation for everything the server touches on disk
//!
//! ## Protocol Overview
//!
//! Every box below is one length-prefixed frame.
//!
//! ```text
//! Client                                         Server
//!   |                                               |
//!   |-- [PUT\n name\n ct_size\n pt_size\n] -------->|
//!   |-- [digest] ---------------------------------->|
//!   |-- [ciphertext] ------------------------------>|
//!   |<-------------------- [OK\n name\n pt_size\n] -|
//!   |<------------------------ [stored digest] -----|
//!   |<------------------------ [empty payload] -----|
//!   |                                               |
//!   |-- [GET\n name] ------------------------------>|
//!   |<-------------------- [OK\n name\n pt_size\n] -|
//!   |<------------------------------- [digest] -----|
//!   |<--------------------------- [ciphertext] -----|
//! ```
//!
//! A failed request is answered with a single `[ERR\n message]` frame.
//!
//! Only the payload is encrypted; headers and digests travel in the clear.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::framing::FrameCodec;
use crate::integrity::is_digest;

pub const PUT_VERB: &str = "PUT";
pub const GET_VERB: &str = "GET";
pub const OK_TOKEN: &str = "OK";
pub const ERR_TOKEN: &str = "ERR";

/// Client-to-server request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Upload an encrypted file
    Put(PutRequest),
    /// Download a file
    Get { filename: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub filename: String,
    pub plaintext_size: u32,
    pub digest: String,
    pub ciphertext: Vec<u8>,
}

impl Request {
    pub fn filename(&self) -> &str {
        match self {
            Request::Put(put) => &put.filename,
            Request::Get { filename } => filename,
        }
    }

    pub fn header(&self) -> Result<RequestHeader> {
        match self {
            Request::Put(put) => put.header(),
            Request::Get { filename } => Ok(RequestHeader::Get {
                filename: filename.clone(),
            }),
        }
    }
}

impl PutRequest {
    pub fn header(&self) -> Result<RequestHeader> {
        Ok(RequestHeader::Put {
            filename: self.filename.clone(),
            ciphertext_size: size_field(self.ciphertext.len())?,
            plaintext_size: self.plaintext_size,
        })
    }
}

/// Header frame of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestHeader {
    Put {
        filename: String,
        ciphertext_size: u32,
        plaintext_size: u32,
    },
    Get {
        filename: String,
    },
}

impl RequestHeader {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RequestHeader::Put {
                filename,
                ciphertext_size,
                plaintext_size,
            } => format!(
                "{}\n{}\n{}\n{}\n",
                PUT_VERB, filename, ciphertext_size, plaintext_size
            )
            .into_bytes(),
            RequestHeader::Get { filename } => format!("{}\n{}", GET_VERB, filename).into_bytes(),
        }
    }

    /// Parse fields in declared order; a missing field is a malformed header
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = header_text(bytes)?;
        let mut fields = text.split('\n');

        let verb = required_field(&mut fields, "request type")?;
        let header = match verb {
            PUT_VERB => RequestHeader::Put {
                filename: required_field(&mut fields, "filename")?.to_string(),
                ciphertext_size: parse_size(required_field(&mut fields, "ciphertext size")?)?,
                plaintext_size: parse_size(required_field(&mut fields, "plaintext size")?)?,
            },
            GET_VERB => RequestHeader::Get {
                filename: required_field(&mut fields, "filename")?.to_string(),
            },
            other => {
                return Err(Error::UnexpectedToken(format!(
                    "request must begin with PUT or GET, got {:?}",
                    other
                )))
            }
        };

        reject_trailing(fields)?;
        Ok(header)
    }
}

/// A successful response: header fields plus digest and payload frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub filename: String,
    /// Plaintext size of the file
    pub size: u32,
    pub digest: String,
    /// Ciphertext for GET, empty for a PUT acknowledgement
    pub payload: Vec<u8>,
}

/// Server-to-client response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Delivery),
    Error(String),
}

/// Header frame of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseHead {
    Ok { filename: String, size: u32 },
    Error(String),
}

impl ResponseHead {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ResponseHead::Ok { filename, size } => {
                format!("{}\n{}\n{}\n", OK_TOKEN, filename, size).into_bytes()
            }
            ResponseHead::Error(message) => format!("{}\n{}", ERR_TOKEN, message).into_bytes(),
        }
    }

    /// Anything not led by an `OK` token is a failure; the text after the
    /// first token is its diagnostic.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = header_text(bytes)?;
        let (token, rest) = text.split_once('\n').unwrap_or((text, ""));

        if token != OK_TOKEN {
            let message = if rest.is_empty() { token } else { rest };
            return Ok(ResponseHead::Error(message.trim_end().to_string()));
        }

        let mut fields = rest.split('\n');
        let head = ResponseHead::Ok {
            filename: required_field(&mut fields, "filename")?.to_string(),
            size: parse_size(required_field(&mut fields, "file size")?)?,
        };
        reject_trailing(fields)?;
        Ok(head)
    }
}

/// Send the header frame of a request
pub async fn send_request_header<W>(writer: &mut W, request: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    FrameCodec::send_frame(writer, &request.header()?.encode()).await
}

/// Send the digest and ciphertext frames that follow a PUT header
pub async fn send_put_body<W>(writer: &mut W, put: &PutRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    FrameCodec::send_frame(writer, put.digest.as_bytes()).await?;
    FrameCodec::send_frame(writer, &put.ciphertext).await
}

/// Send a whole request
pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_request_header(writer, request).await?;
    if let Request::Put(put) = request {
        send_put_body(writer, put).await?;
    }
    Ok(())
}

/// Read a whole request; `Ok(None)` when the client hung up between requests
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncRead + Unpin,
{
    let header = match FrameCodec::recv_frame(reader).await? {
        Some(frame) => RequestHeader::parse(&frame)?,
        None => return Ok(None),
    };

    match header {
        RequestHeader::Get { filename } => Ok(Some(Request::Get { filename })),
        RequestHeader::Put {
            filename,
            ciphertext_size,
            plaintext_size,
        } => {
            let digest = read_digest(reader).await?;
            let ciphertext = FrameCodec::recv_required(reader).await?;
            if ciphertext.len() != ciphertext_size as usize {
                return Err(Error::MalformedHeader(format!(
                    "header declared {} ciphertext bytes, body has {}",
                    ciphertext_size,
                    ciphertext.len()
                )));
            }
            Ok(Some(Request::Put(PutRequest {
                filename,
                plaintext_size,
                digest,
                ciphertext,
            })))
        }
    }
}

/// Send a response: the `OK` triple, or a single `ERR` frame
pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match response {
        Response::Ok(delivery) => {
            // Nothing goes out unless the whole triple fits
            FrameCodec::check_len(delivery.payload.len() as u64)?;
            let head = ResponseHead::Ok {
                filename: delivery.filename.clone(),
                size: delivery.size,
            };
            FrameCodec::send_frame(writer, &head.encode()).await?;
            FrameCodec::send_frame(writer, delivery.digest.as_bytes()).await?;
            FrameCodec::send_frame(writer, &delivery.payload).await
        }
        Response::Error(message) => {
            FrameCodec::send_frame(writer, &ResponseHead::Error(message.clone()).encode()).await
        }
    }
}

/// Read the header frame of a response
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    ResponseHead::parse(&FrameCodec::recv_required(reader).await?)
}

/// Read the digest and payload frames that follow an `OK` header
pub async fn read_delivery<R>(reader: &mut R, filename: String, size: u32) -> Result<Delivery>
where
    R: AsyncRead + Unpin,
{
    let digest = read_digest(reader).await?;
    let payload = FrameCodec::recv_required(reader).await?;
    Ok(Delivery {
        filename,
        size,
        digest,
        payload,
    })
}

/// Read a whole response
pub async fn read_response<R>(reader: &mut R) -> Result<Response>
where
    R: AsyncRead + Unpin,
{
    match read_response_head(reader).await? {
        ResponseHead::Ok { filename, size } => {
            Ok(Response::Ok(read_delivery(reader, filename, size).await?))
        }
        ResponseHead::Error(message) => Ok(Response::Error(message)),
    }
}

async fn read_digest<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let frame = FrameCodec::recv_required(reader).await?;
    match std::str::from_utf8(&frame) {
        Ok(digest) if is_digest(digest) => Ok(digest.to_string()),
        _ => Err(Error::MalformedHeader(
            "digest frame is not a 32-character hex digest".to_string(),
        )),
    }
}

fn header_text(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|_| Error::MalformedHeader("header is not valid UTF-8".to_string()))
}

fn required_field<'a, I>(fields: &mut I, name: &str) -> Result<&'a str>
where
    I: Iterator<Item = &'a str>,
{
    fields
        .next()
        .filter(|field| !field.is_empty())
        .ok_or_else(|| Error::MalformedHeader(format!("missing {}", name)))
}

fn reject_trailing<'a, I>(mut fields: I) -> Result<()>
where
    I: Iterator<Item = &'a str>,
{
    match fields.find(|field| !field.is_empty()) {
        Some(extra) => Err(Error::UnexpectedToken(format!(
            "unexpected trailing field {:?}",
            extra
        ))),
        None => Ok(()),
    }
}

fn parse_size(field: &str) -> Result<u32> {
    field
        .parse()
        .map_err(|_| Error::MalformedHeader(format!("invalid size {:?}", field)))
}

/// Convert a byte count to a header size field
pub fn size_field(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::FrameTooLarge(len as u64, u32::MAX as u64))
}

/// Client-side progress through one exchange
///
/// ```text
/// Idle -> HeaderSent -> BodySent -> AwaitingResponse -------> Done
///                  \                                         /
///                   -> AwaitingHeaderResponse -> AwaitingBody
/// ```
///
/// Any state but `Failed` may fail. `Done` returns to `Idle` for the next
/// request on the same connection; `Failed` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    HeaderSent,
    BodySent,
    AwaitingResponse,
    AwaitingHeaderResponse,
    AwaitingBody,
    Done,
    Failed,
}

impl ExchangeState {
    pub fn can_advance_to(self, next: ExchangeState) -> bool {
        use ExchangeState::*;

        if next == Failed {
            return self != Failed;
        }

        matches!(
            (self, next),
            (Idle, HeaderSent)
                | (HeaderSent, BodySent)
                | (BodySent, AwaitingResponse)
                | (AwaitingResponse, Done)
                | (HeaderSent, AwaitingHeaderResponse)
                | (AwaitingHeaderResponse, AwaitingBody)
                | (AwaitingBody, Done)
                | (Done, Idle)
        )
    }

    pub fn advance(&mut self, next: ExchangeState) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(Error::InvalidState(format!("{:?} -> {:?}", self, next)));
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeState::Done | ExchangeState::Failed)
    }
}

/// Refuse a name that cannot travel as a single header field
pub fn check_header_filename(filename: &str) -> Result<()> {
    if filename.contains('\n') {
        return Err(Error::InvalidFilename(format!(
            "{:?}: newline not allowed",
            filename
        )));
    }
    Ok(())
}

/// Validate filename to prevent directory traversal attacks
///
/// # Security
/// The server joins the result onto its storage root, so anything that could
/// resolve outside the root is refused here, before any filesystem call.
/// Hidden names are refused too, which keeps in-flight `.part` files private.
pub fn validate_filename(filename: &str) -> Result<String> {
    let reject = |reason: &str| Err(Error::InvalidFilename(format!("{:?}: {}", filename, reason)));

    if filename.is_empty() {
        return reject("empty filename");
    }

    if filename.contains('\n') || filename.contains('\0') {
        return reject("control characters not allowed");
    }

    let normalized = filename.replace('\\', "/");

    if normalized.starts_with('/') {
        return reject("absolute paths not allowed");
    }

    // Drive-qualified paths such as C:foo
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return reject("absolute paths not allowed");
    }

    for segment in normalized.split('/') {
        match segment {
            "" => return reject("empty path segment"),
            "." | ".." => return reject("path traversal detected"),
            s if s.starts_with('.') => return reject("hidden files not allowed"),
            _ => {}
        }
    }

    Ok(normalized)
}
