use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bulwark_http::{BoxHandler, Handler, Middleware, Request, Response};
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::error::BreakerError;

/// Marks a 5xx as a breaker failure while keeping the response for the caller.
#[derive(Debug)]
struct ServerError(Response);

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream answered {}", self.0.status())
    }
}

impl std::error::Error for ServerError {}

/// Guards an outbound client handler with a breaker.
///
/// Any status ≥ 500 counts as a failure but is still returned as-is.
#[derive(Clone)]
pub struct BreakerLayer {
    breaker: Arc<CircuitBreaker<Response>>,
}

impl BreakerLayer {
    pub fn new(breaker: Arc<CircuitBreaker<Response>>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker<Response>> {
        &self.breaker
    }
}

impl Middleware for BreakerLayer {
    fn wrap(&self, inner: BoxHandler) -> BoxHandler {
        Arc::new(Guarded {
            breaker: Arc::clone(&self.breaker),
            inner,
        })
    }
}

struct Guarded {
    breaker: Arc<CircuitBreaker<Response>>,
    inner: BoxHandler,
}

#[async_trait]
impl Handler for Guarded {
    async fn call(&self, req: Request) -> Response {
        let inner = Arc::clone(&self.inner);
        let ctx = req.context().clone();
        let result = self
            .breaker
            .execute(&ctx, move |_ctx| async move {
                let resp = inner.call(req).await;
                if resp.is_server_error() {
                    return Err(ServerError(resp).into());
                }
                Ok(resp)
            })
            .await;

        match result {
            Ok(resp) => resp,
            Err(err) => {
                debug!(breaker = self.breaker.name(), error = %err, "guarded call failed");
                error_response(err)
            }
        }
    }
}

fn error_response(err: BreakerError) -> Response {
    match err {
        BreakerError::Inner(err) => match err.downcast::<ServerError>() {
            Ok(ServerError(resp)) => resp,
            Err(other) => Response::text(502, other.to_string()),
        },
        BreakerError::Open | BreakerError::HalfOpenLimitExceeded => {
            Response::text(503, "Service temporarily unavailable").with_header("X-Circuit-Breaker", "open")
        }
        BreakerError::Timeout(_) => {
            Response::text(504, "Upstream timed out").with_header("X-Circuit-Breaker", "timeout")
        }
        BreakerError::Cancelled => Response::text(503, "Request cancelled"),
        BreakerError::Panicked(_) | BreakerError::Config(_) => Response::text(500, "Internal server error"),
    }
}
