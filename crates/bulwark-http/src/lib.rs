//! Minimal HTTP abstraction shared by the interceptors.
//!
//! Routing, parsing and serialization belong to whatever server embeds
//! bulwark; the components only need a request to inspect and a response to
//! produce. Every interceptor implements [`Middleware::wrap`], and a
//! [`Stack`] composes them outermost-first:
//!
//! ```text
//!   request ──▶ RateLimitLayer ──▶ ChaosLayer ──▶ handler
//!   response ◀──────────────────────────────────────┘
//! ```
//!
//! The breaker guards outbound calls made *by* a handler, so its layer wraps
//! a client handler rather than sitting in the inbound stack.

mod handler;
mod header;
mod request;
mod response;

pub use handler::{handler_fn, BoxHandler, Handler, Middleware, Stack};
pub use header::{Header, HeaderMap};
pub use request::Request;
pub use response::Response;
