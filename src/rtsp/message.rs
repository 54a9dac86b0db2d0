//! RTSP/1.0 wire format
//!
//! Requests and responses are CRLF-framed with case-normalized headers and
//! an optional body sized by `Content-Length`. Interleaved binary frames
//! (`$<channel><len16><payload>`) share the TCP stream with requests; a
//! request reader must be able to skip frames and resynchronize on the next
//! request.

use std::collections::BTreeMap;

use tokio::io::{AsyncBufRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const RTSP_PROTOCOL: &str = "RTSP/1.0";

const HEADER_MAX_ENTRY_COUNT: usize = 255;
const HEADER_MAX_KEY_LENGTH: usize = 512;
const HEADER_MAX_VALUE_LENGTH: usize = 2048;
const REQUEST_MAX_METHOD_LENGTH: usize = 64;
const REQUEST_MAX_URL_LENGTH: usize = 2048;
const REQUEST_MAX_PROTOCOL_LENGTH: usize = 64;
const INTERLEAVED_MAX_PAYLOAD: usize = 64 * 1024;

/// RTSP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Announce,
    Describe,
    GetParameter,
    Options,
    Pause,
    Play,
    Record,
    Setup,
    SetParameter,
    Teardown,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ANNOUNCE" => Some(Self::Announce),
            "DESCRIBE" => Some(Self::Describe),
            "GET_PARAMETER" => Some(Self::GetParameter),
            "OPTIONS" => Some(Self::Options),
            "PAUSE" => Some(Self::Pause),
            "PLAY" => Some(Self::Play),
            "RECORD" => Some(Self::Record),
            "SETUP" => Some(Self::Setup),
            "SET_PARAMETER" => Some(Self::SetParameter),
            "TEARDOWN" => Some(Self::Teardown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Announce => "ANNOUNCE",
            Self::Describe => "DESCRIBE",
            Self::GetParameter => "GET_PARAMETER",
            Self::Options => "OPTIONS",
            Self::Pause => "PAUSE",
            Self::Play => "PLAY",
            Self::Record => "RECORD",
            Self::Setup => "SETUP",
            Self::SetParameter => "SET_PARAMETER",
            Self::Teardown => "TEARDOWN",
        }
    }
}

/// Normalize a header key: fixed special cases, then title-case per token.
pub fn normalize_header_key(key: &str) -> String {
    match key.to_ascii_lowercase().as_str() {
        "cseq" => return "CSeq".to_string(),
        "www-authenticate" => return "WWW-Authenticate".to_string(),
        "rtp-info" => return "RTP-Info".to_string(),
        _ => {}
    }

    key.split('-')
        .map(|token| {
            let mut chars = token.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// RTSP header map, present in both requests and responses. Keys are
/// normalized on insert; serialization iterates in sorted key order for
/// deterministic output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header(BTreeMap<String, Vec<String>>);

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .entry(normalize_header_key(key))
            .or_default()
            .push(value.into());
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.0
            .get(&normalize_header_key(key))
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    pub fn entry_count(&self) -> usize {
        self.0.values().map(|v| v.len()).sum()
    }

    pub async fn read<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut header = Header::new();
        let mut count = 0usize;

        loop {
            let byt = r.read_u8().await?;
            if byt == b'\r' {
                read_newline(r).await?;
                break;
            }

            if count >= HEADER_MAX_ENTRY_COUNT {
                return Err(Error::Protocol(format!(
                    "headers count exceeds {HEADER_MAX_ENTRY_COUNT}"
                )));
            }

            let mut key_bytes = read_bytes_limited(r, b':', HEADER_MAX_KEY_LENGTH - 1)
                .await
                .map_err(|_| Error::Protocol("header value is missing".to_string()))?;
            key_bytes.pop();
            let mut key = (byt as char).to_string();
            key.push_str(
                std::str::from_utf8(&key_bytes)
                    .map_err(|_| Error::Protocol("invalid header key".to_string()))?,
            );
            let key = normalize_header_key(&key);

            // The field value may be preceded by any amount of spaces.
            loop {
                let byt = r.read_u8().await?;
                if byt != b' ' {
                    let mut value_bytes = if byt == b'\r' {
                        vec![b'\r']
                    } else {
                        let mut v = vec![byt];
                        v.extend(read_bytes_limited(r, b'\r', HEADER_MAX_VALUE_LENGTH).await?);
                        v
                    };
                    value_bytes.pop();
                    read_newline(r).await?;
                    let value = std::str::from_utf8(&value_bytes)
                        .map_err(|_| Error::Protocol("invalid header value".to_string()))?
                        .to_string();
                    header.0.entry(key).or_default().push(value);
                    break;
                }
            }
            count += 1;
        }

        Ok(header)
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        for (key, values) in &self.0 {
            for value in values {
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(b": ");
                buf.extend_from_slice(value.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
        }
        buf.extend_from_slice(b"\r\n");
    }
}

/// An RTSP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub header: Header,
    pub body: Vec<u8>,
}

impl Request {
    /// Path component of the request URL, without the leading slash.
    pub fn path(&self) -> String {
        path_of_url(&self.url)
    }

    pub(crate) async fn read_with_first<R: AsyncBufRead + Unpin>(
        r: &mut R,
        first: u8,
    ) -> Result<Self> {
        let mut method_bytes = vec![first];
        method_bytes.extend(read_bytes_limited(r, b' ', REQUEST_MAX_METHOD_LENGTH).await?);
        method_bytes.pop();
        let method_str = std::str::from_utf8(&method_bytes)
            .map_err(|_| Error::Protocol("invalid method".to_string()))?;
        if method_str.is_empty() {
            return Err(Error::Protocol("empty method".to_string()));
        }
        let method = Method::parse(method_str)
            .ok_or_else(|| Error::Protocol(format!("unknown method: {method_str}")))?;

        let mut url_bytes = read_bytes_limited(r, b' ', REQUEST_MAX_URL_LENGTH).await?;
        url_bytes.pop();
        let url = std::str::from_utf8(&url_bytes)
            .map_err(|_| Error::Protocol("invalid URL".to_string()))?
            .to_string();
        if !url.starts_with("rtsp://") && url != "*" {
            return Err(Error::Protocol(format!("invalid URL ({url})")));
        }

        let mut proto_bytes = read_bytes_limited(r, b'\r', REQUEST_MAX_PROTOCOL_LENGTH).await?;
        proto_bytes.pop();
        if proto_bytes != RTSP_PROTOCOL.as_bytes() {
            return Err(Error::Protocol(format!(
                "expected '{RTSP_PROTOCOL}', got {:?}",
                String::from_utf8_lossy(&proto_bytes)
            )));
        }
        read_newline(r).await?;

        let header = Header::read(r).await?;
        let body = read_body(r, &header).await?;

        Ok(Self {
            method,
            url,
            header,
            body,
        })
    }

    pub async fn read<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Self> {
        let first = r.read_u8().await?;
        Self::read_with_first(r, first).await
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.url.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(RTSP_PROTOCOL.as_bytes());
        buf.extend_from_slice(b"\r\n");

        let mut header = self.header.clone();
        if !self.body.is_empty() {
            header.set("Content-Length", self.body.len().to_string());
        }
        header.write(buf);
        buf.extend_from_slice(&self.body);
    }
}

/// An RTSP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub header: Header,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            header: Header::new(),
            body: Vec::new(),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            454 => "Session Not Found",
            455 => "Method Not Valid in This State",
            461 => "Unsupported Transport",
            500 => "Internal Server Error",
            _ => "Unknown",
        }
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(RTSP_PROTOCOL.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.reason().as_bytes());
        buf.extend_from_slice(b"\r\n");

        let mut header = self.header.clone();
        if !self.body.is_empty() {
            header.set("Content-Length", self.body.len().to_string());
        }
        header.write(buf);
        buf.extend_from_slice(&self.body);
    }
}

/// Interleaved binary frame: `$<channel><len16><payload>`.
#[derive(Debug, Clone)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

impl InterleavedFrame {
    /// Read the frame after the leading `$` has been consumed.
    pub async fn read_after_magic<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Self> {
        let channel = r.read_u8().await?;
        let len = r.read_u16().await? as usize;
        if len > INTERLEAVED_MAX_PAYLOAD {
            return Err(Error::Protocol(format!("frame too large: {len}")));
        }
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;
        Ok(Self { channel, payload })
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(b'$');
        buf.push(self.channel);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }
}

/// Either of the two things a server can receive on an RTSP TCP stream.
#[derive(Debug)]
pub enum Incoming {
    Request(Request),
    Frame(InterleavedFrame),
}

impl Incoming {
    /// Read the next request or interleaved frame, resynchronizing on
    /// whichever comes first.
    pub async fn read<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Self> {
        let first = r.read_u8().await?;
        if first == b'$' {
            Ok(Self::Frame(InterleavedFrame::read_after_magic(r).await?))
        } else {
            Ok(Self::Request(Request::read_with_first(r, first).await?))
        }
    }

    /// Read the next request, skipping any interleaved frames before it.
    pub async fn read_request_ignore_frames<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Request> {
        loop {
            if let Self::Request(req) = Self::read(r).await? {
                return Ok(req);
            }
        }
    }
}

fn path_of_url(url: &str) -> String {
    let without_scheme = url.strip_prefix("rtsp://").unwrap_or(url);
    match without_scheme.find('/') {
        Some(idx) => {
            let path = &without_scheme[idx + 1..];
            // Strip query and track control suffixes are handled by callers.
            path.split('?').next().unwrap_or("").to_string()
        }
        None => String::new(),
    }
}

async fn read_bytes_limited<R: AsyncBufRead + Unpin>(
    r: &mut R,
    delim: u8,
    max: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let byt = r.read_u8().await?;
        out.push(byt);
        if byt == delim {
            return Ok(out);
        }
        if out.len() >= max {
            return Err(Error::Protocol(format!(
                "field exceeds {max} bytes without delimiter '{}'",
                delim as char
            )));
        }
    }
}

async fn read_newline<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<()> {
    let byt = r.read_u8().await?;
    if byt != b'\n' {
        return Err(Error::Protocol("expected newline".to_string()));
    }
    Ok(())
}

async fn read_body<R: AsyncBufRead + Unpin>(r: &mut R, header: &Header) -> Result<Vec<u8>> {
    let len = match header.first("Content-Length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| Error::Protocol("invalid Content-Length".to_string()))?,
        None => return Ok(Vec::new()),
    };
    if len > REQUEST_MAX_URL_LENGTH * 16 {
        return Err(Error::Protocol(format!("body too large: {len}")));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}
