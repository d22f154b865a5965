// src/interception/http_interceptor.rs
//! Intercepting HTTP/1.x proxy
//!
//! Handles one request/response exchange on a redirected connection:
//!
//! 1. **read_request**: parse the head through the request tap and work out
//!    how the body is framed
//! 2. **fix_request**: rebuild the absolute target from `Host` and path
//! 3. **forward**: dial the original destination and send the request with
//!    a hyper HTTP/1.1 client connection, streaming the body from the client
//!    as it arrives
//! 4. **relay_response**: re-serialize the status line and headers, then
//!    stream the body to the client through the response tap
//!
//! The exchange, both taps and the hyper connection driver all run on one
//! `TaskTracker`. The client transport is handed back only after every one
//! of them has finished, so the caller never closes it under an observer.

use crate::interception::request::{self, fix_request, BodyDecoder, BodyFraming, InterceptedRequest};
use crate::interception::rewind::Rewind;
use crate::interception::tap::{DebugTap, TapDirection, TappedStream};
use crate::interception::tunnel::dial_origin;
use crate::observability;
use crate::runtime::connection::ConnectionContext;
use crate::utils::config::LimitSettings;
use crate::utils::errors::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::{SinkExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1;
use hyper::header::TRANSFER_ENCODING;
use hyper::Response;
use hyper_util::rt::TokioIo;
use std::io;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::io::StreamReader;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Size of the buffer used to relay response bodies
const RELAY_CHUNK: usize = 16 * 1024;

/// Request body frames queued ahead of the origin connection
const BODY_FRAMES: usize = 4;

type RequestBody = UnsyncBoxBody<Bytes, io::Error>;

/// HTTP interceptor
#[derive(Clone)]
pub struct HttpInterceptor {
    limits: LimitSettings,
    tap: Option<DebugTap>,
}

impl HttpInterceptor {
    /// Create an interceptor; `tap` is `None` when debug taps are disabled
    pub fn new(limits: LimitSettings, tap: Option<DebugTap>) -> Self {
        Self { limits, tap }
    }

    /// Run one exchange on `client` and hand the transport back
    ///
    /// Failures are logged and counted here. `None` means the exchange task
    /// was lost and the transport with it.
    pub async fn intercept<S>(&self, ctx: &ConnectionContext, client: S) -> Option<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        observability::record_connection("intercept");

        let tracker = TaskTracker::new();
        let exchange = Exchange {
            ctx: *ctx,
            limits: self.limits.clone(),
            tap: self.tap.clone(),
            tracker: tracker.clone(),
        };
        let handle = tracker.spawn(exchange.run(client));

        tracker.close();
        tracker.wait().await;

        match handle.await {
            Ok((client, result)) => {
                if let Err(e) = result {
                    ctx.report(&e);
                }
                Some(client)
            }
            Err(e) => {
                error!(connection = ctx.id, "Exchange task failed: {}", e);
                None
            }
        }
    }
}

/// State of a single exchange
struct Exchange {
    ctx: ConnectionContext,
    limits: LimitSettings,
    tap: Option<DebugTap>,
    tracker: TaskTracker,
}

impl Exchange {
    async fn run<S>(self, client: S) -> (S, Result<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut client = self.tapped(TapDirection::Request, String::new(), client);
        let result = self.exchange(&mut client).await;
        (client.into_inner(), result)
    }

    async fn exchange<S>(&self, client: &mut TappedStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = BytesMut::with_capacity(4096);
        let head = request::read_head(client, &mut buf, self.limits.max_header_bytes).await?;

        let request = fix_request(head)?;
        let decoder = BodyDecoder::new(request.framing, self.limits.max_body_bytes)?;
        info!(
            connection = self.ctx.id,
            destination = %self.ctx.destination,
            "Intercepted {} {}",
            request.method,
            request.target
        );

        let response = {
            // Body bytes that arrived with the head are replayed first
            let mut body = BufReader::new(Rewind::new(buf.freeze(), &mut *client));
            self.forward(request, decoder, &mut body).await?
        };
        client.detach();

        self.relay_response(client, response).await
    }

    async fn forward<R>(
        &self,
        request: InterceptedRequest,
        decoder: BodyDecoder,
        body: &mut R,
    ) -> Result<Response<Incoming>>
    where
        R: AsyncBufRead + Unpin,
    {
        let addr = self.ctx.destination.socket_addr();
        let origin = dial_origin(addr, self.limits.dial_timeout()).await?;

        let (mut sender, conn) = http1::handshake::<_, RequestBody>(TokioIo::new(origin))
            .await
            .map_err(|e| ProxyError::Forward(format!("handshake: {}", e)))?;

        let id = self.ctx.id;
        self.tracker.spawn(async move {
            if let Err(e) = conn.await {
                debug!(connection = id, "Origin connection ended: {}", e);
            }
        });

        let response = if request.framing == BodyFraming::Empty {
            let request = request.into_hyper(
                Empty::<Bytes>::new()
                    .map_err(|never| match never {})
                    .boxed_unsync(),
            )?;
            sender.send_request(request).await
        } else {
            let (tx, rx) = mpsc::channel(BODY_FRAMES);
            let request = request.into_hyper(StreamBody::new(rx).boxed_unsync())?;
            let (pumped, response) =
                tokio::join!(self.pump_body(decoder, body, tx), sender.send_request(request));
            pumped?;
            response
        };

        let response = response.map_err(|e| ProxyError::Forward(e.to_string()))?;
        debug!(connection = id, status = %response.status(), "Response received");
        Ok(response)
    }

    /// Feed the client's request body to the origin connection
    async fn pump_body<R>(
        &self,
        mut decoder: BodyDecoder,
        body: &mut R,
        mut tx: mpsc::Sender<io::Result<Frame<Bytes>>>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match decoder.next_chunk(body).await {
                Ok(Some(piece)) => {
                    if tx.send(Ok(Frame::data(piece))).await.is_err() {
                        // The origin answered without reading the whole body
                        debug!(
                            connection = self.ctx.id,
                            sent = decoder.received(),
                            "Origin stopped reading the request body"
                        );
                        return Ok(());
                    }
                }
                Ok(None) => {
                    debug!(
                        connection = self.ctx.id,
                        body_len = decoder.received(),
                        "Request body forwarded"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    return Err(e);
                }
            }
        }
    }

    async fn relay_response<W>(&self, client: &mut W, response: Response<Incoming>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let head = render_response_head(&response);
        let body = response.into_body();

        client
            .write_all(head.as_bytes())
            .await
            .map_err(|e| ProxyError::ClientWrite(e.to_string()))?;

        let data = BodyStream::new(body)
            .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())))
            .map_err(io::Error::other);
        let mut body = self.tapped(
            TapDirection::Response,
            head,
            StreamReader::new(Box::pin(data)),
        );

        let mut chunk = vec![0u8; RELAY_CHUNK];
        loop {
            let n = body
                .read(&mut chunk)
                .await
                .map_err(|e| ProxyError::Forward(format!("response body: {}", e)))?;
            if n == 0 {
                break;
            }
            client
                .write_all(&chunk[..n])
                .await
                .map_err(|e| ProxyError::ClientWrite(e.to_string()))?;
        }

        client
            .flush()
            .await
            .map_err(|e| ProxyError::ClientWrite(e.to_string()))
    }

    fn tapped<R>(&self, direction: TapDirection, banner: String, inner: R) -> TappedStream<R> {
        match &self.tap {
            Some(tap) => tap.attach(self.ctx.id, direction, banner, inner, &self.tracker),
            None => TappedStream::untapped(inner),
        }
    }
}

/// Status line and headers as relayed to the client
///
/// Each header name appears once with its values joined by `", "`.
/// `Transfer-Encoding` is left out: the body is relayed de-chunked and the
/// connection closes after it.
pub fn render_response_head<B>(response: &Response<B>) -> String {
    let status = response.status();
    let reason = response
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_default();

    let mut head = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason);

    let headers = response.headers();
    for name in headers.keys() {
        if name == TRANSFER_ENCODING {
            continue;
        }
        let values: Vec<_> = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()))
            .collect();
        head.push_str(&format!("{}: {}\r\n", name, values.join(", ")));
    }

    head.push_str("\r\n");
    head
}
