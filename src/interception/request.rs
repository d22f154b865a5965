// src/interception/request.rs
//! HTTP/1.x request reading and target reconstruction
//!
//! Redirected clients believe they are talking to the origin, so requests
//! arrive in origin form (`GET /path`) with a `Host` header. Before the proxy
//! re-issues a request it rebuilds the absolute target
//! `http://{Host}{path}` from those two pieces.
//!
//! Bodies are never buffered whole: [`BodyDecoder`] hands them out as they
//! arrive so they can be streamed on to the origin.

use crate::utils::errors::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Method, Uri};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tracing::trace;

/// Maximum number of request headers accepted
const MAX_HEADERS: usize = 100;

/// Longest chunk-size or trailer line accepted in a chunked body
const MAX_CHUNK_LINE: u64 = 4096;

/// Scheme used for every rebuilt target (no TLS interception)
const SCHEME: &str = "http";

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,

    /// Request target exactly as the client sent it
    pub target: String,

    /// Minor HTTP version (1 for HTTP/1.1)
    pub version: u8,

    pub headers: HeaderMap,

    /// Bytes occupied by the head, terminator included
    pub len: usize,
}

impl RequestHead {
    /// Parse a complete head from `buf`; `Ok(None)` if more bytes are needed
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::RequestParse(e.to_string())),
        };

        let method = req
            .method
            .ok_or_else(|| ProxyError::RequestParse("missing method".into()))
            .and_then(|m| {
                Method::from_bytes(m.as_bytes())
                    .map_err(|e| ProxyError::RequestParse(format!("method: {}", e)))
            })?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::RequestParse("missing request target".into()))?
            .to_string();
        let version = req.version.unwrap_or(1);

        let mut map = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| ProxyError::RequestParse(format!("header name: {}", e)))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| ProxyError::RequestParse(format!("header value: {}", e)))?;
            map.append(name, value);
        }

        Ok(Some(Self {
            method,
            target,
            version,
            headers: map,
            len,
        }))
    }

    /// Absolute target `http://{authority}{path}`
    ///
    /// The authority is the `Host` header for an origin-form target and the
    /// target's own authority for an absolute-form one. Path and query are
    /// kept as received. Only `http` targets can be rebuilt.
    pub fn absolute_target(&self) -> Result<Uri> {
        let (authority, path_and_query) = if self.target.starts_with('/') {
            let host = self
                .host_header()
                .ok_or_else(|| ProxyError::RequestRewrite("request has no Host".into()))?;
            (host.to_string(), self.target.clone())
        } else {
            let uri = self.target.parse::<Uri>().map_err(|e| {
                ProxyError::RequestRewrite(format!("target {:?}: {}", self.target, e))
            })?;
            match uri.scheme_str() {
                Some(scheme) if scheme.eq_ignore_ascii_case(SCHEME) => {}
                Some(scheme) => {
                    return Err(ProxyError::RequestRewrite(format!(
                        "unsupported scheme {:?}",
                        scheme
                    )))
                }
                None => {
                    return Err(ProxyError::RequestRewrite(format!(
                        "target {:?} is neither origin nor absolute form",
                        self.target
                    )))
                }
            }
            let authority = uri
                .authority()
                .map(|authority| authority.as_str().to_string())
                .ok_or_else(|| ProxyError::RequestRewrite("target has no authority".into()))?;
            let path_and_query = match uri.query() {
                Some(query) => format!("{}?{}", uri.path(), query),
                None => uri.path().to_string(),
            };
            (authority, path_and_query)
        };

        Uri::builder()
            .scheme(SCHEME)
            .authority(authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
            .map_err(|e| {
                ProxyError::RequestRewrite(format!("{}{}: {}", authority, path_and_query, e))
            })
    }

    /// How the body following this head is delimited
    ///
    /// Chunked coding takes precedence over `Content-Length`.
    pub fn body_framing(&self) -> Result<BodyFraming> {
        if self.is_chunked() {
            return Ok(BodyFraming::Chunked);
        }
        Ok(match self.content_length()? {
            None | Some(0) => BodyFraming::Empty,
            Some(len) => BodyFraming::Length(len),
        })
    }

    fn host_header(&self) -> Option<&str> {
        self.headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|host| !host.is_empty())
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    fn content_length(&self) -> Result<Option<u64>> {
        match self.headers.get(CONTENT_LENGTH) {
            None => Ok(None),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Some)
                .ok_or_else(|| ProxyError::RequestParse(format!("bad Content-Length {:?}", value))),
        }
    }
}

/// How a request body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,

    /// `Content-Length` bytes follow the head
    Length(u64),

    /// `Transfer-Encoding: chunked`
    Chunked,
}

/// Cheap check on the first bytes of a connection
pub fn looks_like_http(data: &[u8]) -> bool {
    const METHODS: [&[u8]; 9] = [
        b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"OPTI", b"PATC", b"CONN", b"TRAC",
    ];

    if data.len() < 4 {
        // Too short to rule out; compare what is there
        return METHODS.iter().any(|m| m.starts_with(data));
    }
    METHODS.contains(&&data[..4])
}

/// Opening bytes read from a client and the head they contained, if any
#[derive(Debug)]
pub struct Sniffed {
    pub bytes: Bytes,
    pub head: Option<RequestHead>,
}

/// Read the client's opening bytes until an HTTP head is complete
///
/// Stops early, with `head: None`, if nothing arrives within `first_read`,
/// the bytes do not look like HTTP, the head exceeds `max_head`, or the
/// client closes. Every byte consumed is returned so it can be replayed.
pub async fn sniff<R>(reader: &mut R, first_read: Duration, max_head: usize) -> Result<Sniffed>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    match tokio::time::timeout(first_read, reader.read_buf(&mut buf)).await {
        Err(_) => {
            trace!("No opening bytes within {:?}", first_read);
            return Ok(Sniffed {
                bytes: Bytes::new(),
                head: None,
            });
        }
        Ok(read) => {
            read?;
        }
    }

    loop {
        if !looks_like_http(&buf) {
            break;
        }

        match RequestHead::parse(&buf) {
            Ok(Some(head)) => {
                return Ok(Sniffed {
                    bytes: buf.freeze(),
                    head: Some(head),
                })
            }
            Ok(None) if buf.len() < max_head => {}
            Ok(None) | Err(_) => break,
        }

        if reader.read_buf(&mut buf).await? == 0 {
            break;
        }
    }

    Ok(Sniffed {
        bytes: buf.freeze(),
        head: None,
    })
}

/// Read a request head; leftover bytes past the head stay in `buf`
pub async fn read_head<R>(reader: &mut R, buf: &mut BytesMut, max_head: usize) -> Result<RequestHead>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(head) = RequestHead::parse(buf)? {
            let _ = buf.split_to(head.len);
            return Ok(head);
        }

        if buf.len() >= max_head {
            return Err(ProxyError::RequestParse(format!(
                "request head exceeds {} bytes",
                max_head
            )));
        }

        let n = reader
            .read_buf(buf)
            .await
            .map_err(|e| ProxyError::RequestParse(e.to_string()))?;
        if n == 0 {
            return Err(ProxyError::RequestParse(
                "connection closed before end of request head".into(),
            ));
        }
    }
}

/// Incremental request body reader
///
/// Hands out the body piece by piece as it arrives, de-chunked, so bodies
/// of any size can be streamed to the origin.
#[derive(Debug)]
pub struct BodyDecoder {
    framing: BodyFraming,

    /// Bytes left in the body (length framing) or in the current chunk
    remaining: u64,

    received: u64,
    limit: Option<u64>,

    /// A chunk's data has been read and its CRLF has not
    chunk_open: bool,

    done: bool,
}

impl BodyDecoder {
    /// Fails right away when a declared length is over `limit`
    pub fn new(framing: BodyFraming, limit: Option<u64>) -> Result<Self> {
        let remaining = match framing {
            BodyFraming::Length(len) => {
                check_limit(0, len, limit)?;
                len
            }
            BodyFraming::Empty | BodyFraming::Chunked => 0,
        };

        Ok(Self {
            framing,
            remaining,
            received: 0,
            limit,
            chunk_open: false,
            done: framing == BodyFraming::Empty,
        })
    }

    /// Body bytes handed out so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Next piece of the body; `None` once it is complete
    pub async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
    where
        R: AsyncBufRead + Unpin,
    {
        if self.done {
            return Ok(None);
        }

        if self.remaining == 0 {
            match self.framing {
                BodyFraming::Chunked => {
                    if !self.next_chunk_size(reader).await? {
                        self.done = true;
                        return Ok(None);
                    }
                }
                BodyFraming::Empty | BodyFraming::Length(_) => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }

        let available = reader
            .fill_buf()
            .await
            .map_err(|e| ProxyError::RequestParse(format!("body: {}", e)))?;
        if available.is_empty() {
            return Err(ProxyError::RequestParse(
                "connection closed before end of body".into(),
            ));
        }

        let n = available
            .len()
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let piece = Bytes::copy_from_slice(&available[..n]);
        reader.consume(n);

        self.remaining -= n as u64;
        self.received += n as u64;
        Ok(Some(piece))
    }

    /// Read up to the next chunk's data; `false` after the last chunk and
    /// its trailers
    async fn next_chunk_size<R>(&mut self, reader: &mut R) -> Result<bool>
    where
        R: AsyncBufRead + Unpin,
    {
        if self.chunk_open {
            if !read_line(reader).await?.is_empty() {
                return Err(ProxyError::RequestParse("chunk not followed by CRLF".into()));
            }
            self.chunk_open = false;
        }

        let line = read_line(reader).await?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| ProxyError::RequestParse(format!("bad chunk size {:?}", size_field)))?;

        if size == 0 {
            // Trailers, up to the empty line
            while !read_line(reader).await?.is_empty() {}
            return Ok(false);
        }

        check_limit(self.received, size, self.limit)?;
        self.remaining = size;
        self.chunk_open = true;
        Ok(true)
    }
}

fn check_limit(received: u64, incoming: u64, limit: Option<u64>) -> Result<()> {
    let Some(limit) = limit else {
        return Ok(());
    };
    match received.checked_add(incoming) {
        Some(total) if total <= limit => Ok(()),
        _ => Err(ProxyError::RequestParse(format!(
            "body exceeds limit of {} bytes",
            limit
        ))),
    }
}

/// One CRLF-terminated line without its terminator
async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE)
        .read_line(&mut line)
        .await
        .map_err(|e| ProxyError::RequestParse(format!("chunked body: {}", e)))?;

    if n == 0 || !line.ends_with('\n') {
        return Err(ProxyError::RequestParse("truncated chunked body".into()));
    }

    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// A request ready to be re-issued to the origin
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,

    /// Absolute target rebuilt from `Host` and path
    pub target: Uri,

    pub headers: HeaderMap,

    pub framing: BodyFraming,
}

impl InterceptedRequest {
    /// Origin-form target sent on the wire (`/path?query`)
    pub fn origin_form(&self) -> &str {
        self.target
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    /// Build the outgoing hyper request around `body`
    ///
    /// `Transfer-Encoding` is dropped since the body is re-framed by hyper.
    /// `Content-Length` is kept unless the client sent a chunked body.
    pub fn into_hyper<B>(self, body: B) -> Result<hyper::Request<B>> {
        let mut builder = hyper::Request::builder()
            .method(self.method.clone())
            .uri(self.origin_form());

        let chunked = self.framing == BodyFraming::Chunked;
        for (name, value) in self.headers.iter() {
            if name == TRANSFER_ENCODING || (chunked && name == CONTENT_LENGTH) {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder
            .body(body)
            .map_err(|e| ProxyError::RequestRewrite(e.to_string()))
    }
}

/// Replace the received target with the absolute one
pub fn fix_request(head: RequestHead) -> Result<InterceptedRequest> {
    let framing = head.body_framing()?;
    let target = head.absolute_target()?;
    let mut headers = head.headers;

    // An absolute-form request may omit Host; the origin needs one
    if !headers.contains_key(HOST) {
        if let Some(authority) = target.authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| ProxyError::RequestRewrite(e.to_string()))?;
            headers.insert(HOST, value);
        }
    }

    Ok(InterceptedRequest {
        method: head.method,
        target,
        headers,
        framing,
    })
}
