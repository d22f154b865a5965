// src/interception/mod.rs
//! Traffic handling for redirected connections
//!
//! - **Destination**: recovers where the client meant to connect
//! - **Policy**: decides per request URL whether to intercept
//! - **Request**: HTTP/1.x head sniffing, parsing and target rebuilding
//! - **Tunnel**: opaque byte relay to the original destination
//! - **HTTP Interceptor**: parses, re-issues and relays one exchange
//! - **Tap**: mirrors intercepted bytes to a debug observer
//!
//! # Architecture
//!
//! ```text
//! redirected client
//!     │
//!     ├─ SO_ORIGINAL_DST ──► Destination
//!     ├─ opening bytes ────► Request::sniff ──► Policy
//!     │
//!     ├─ no match / not HTTP ──► Tunnel ──────────────► origin
//!     └─ match ────────────────► HTTP Interceptor ────► origin
//!                                  └─ Tap (request, response)
//! ```

pub mod destination;
pub mod http_interceptor;
pub mod policy;
pub mod request;
pub mod rewind;
pub mod tap;
pub mod tunnel;

// Re-export commonly used types
pub use destination::{DestinationResolver, OriginalDestination, SockOptResolver, StaticResolver};
pub use http_interceptor::HttpInterceptor;
pub use policy::{decide, InterceptConfig, InterceptRule};
pub use request::{fix_request, BodyDecoder, BodyFraming, InterceptedRequest, RequestHead};
pub use rewind::Rewind;
pub use tap::{ConsoleTap, DebugTap, TapDirection, TapSink, TapSinkFactory, TappedStream};
pub use tunnel::{dial_origin, PassthroughTunnel};
