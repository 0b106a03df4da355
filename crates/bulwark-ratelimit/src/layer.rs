use std::sync::Arc;

use async_trait::async_trait;
use bulwark_http::{BoxHandler, Handler, Middleware, Request, Response};
use tracing::warn;

use crate::algorithm::Decision;
use crate::limiter::RateLimiter;

/// Outermost interceptor: rejects with 429 once any key is exhausted.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Middleware for RateLimitLayer {
    fn wrap(&self, inner: BoxHandler) -> BoxHandler {
        Arc::new(RateLimited {
            limiter: Arc::clone(&self.limiter),
            inner,
        })
    }
}

struct RateLimited {
    limiter: Arc<RateLimiter>,
    inner: BoxHandler,
}

impl RateLimited {
    fn apply_headers(&self, resp: &mut Response, decision: &Decision) {
        let headers = resp.headers_mut();
        headers.set("X-RateLimit-Limit", decision.limit.to_string());
        headers.set("X-RateLimit-Remaining", decision.remaining.to_string());
        headers.set(
            "X-RateLimit-Reset",
            self.limiter.reset_at_unix(decision).to_string(),
        );
    }
}

#[async_trait]
impl Handler for RateLimited {
    async fn call(&self, req: Request) -> Response {
        let ctx = req.context().clone();
        let verdict = self.limiter.check_request(&ctx, &req).await;
        let config = self.limiter.config();

        if let Some(key) = &verdict.denied_by {
            if config.block_on_exceed {
                let mut resp = Response::text(429, "Rate limit exceeded");
                if config.headers_enabled {
                    self.apply_headers(&mut resp, &verdict.decision);
                }
                if config.retry_after_enabled {
                    resp.headers_mut()
                        .set("Retry-After", verdict.decision.retry_after_secs().to_string());
                }
                return resp;
            }
            warn!(
                key = %key,
                limit = verdict.decision.limit,
                path = req.path(),
                "rate limit exceeded (not blocking)"
            );
        }

        let mut resp = self.inner.call(req).await;
        if config.headers_enabled {
            self.apply_headers(&mut resp, &verdict.decision);
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use bulwark_core::{Context, ManualClock, MemoryKvStore};
    use bulwark_http::handler_fn;
    use std::time::Duration;

    fn wrapped(config: RateLimitConfig) -> BoxHandler {
        let limiter = RateLimiter::new(config, ManualClock::new().shared()).unwrap();
        RateLimitLayer::new(Arc::new(limiter)).wrap(handler_fn(|_req| async { Response::ok("ok") }))
    }

    #[tokio::test]
    async fn allowed_response_carries_headers() {
        let handler = wrapped(RateLimitConfig {
            default_limit: 5,
            default_window: Duration::from_secs(1),
            ..Default::default()
        });
        let resp = handler.call(Request::get("/a")).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("X-RateLimit-Limit"), Some("5"));
        assert_eq!(resp.headers().get("X-RateLimit-Remaining"), Some("4"));
        assert_eq!(
            resp.headers().get("X-RateLimit-Reset"),
            Some((ManualClock::UNIX_ORIGIN_SECS + 1).to_string().as_str())
        );
    }

    #[tokio::test]
    async fn observability_mode_lets_denied_requests_through() {
        let handler = wrapped(RateLimitConfig {
            default_limit: 1,
            default_window: Duration::from_secs(1),
            block_on_exceed: false,
            ..Default::default()
        });
        assert_eq!(handler.call(Request::get("/a")).await.status(), 200);
        let resp = handler.call(Request::get("/a")).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("X-RateLimit-Remaining"), Some("0"));
    }

    #[tokio::test]
    async fn headers_can_be_disabled() {
        let handler = wrapped(RateLimitConfig {
            default_limit: 1,
            default_window: Duration::from_secs(1),
            headers_enabled: false,
            retry_after_enabled: false,
            ..Default::default()
        });
        handler.call(Request::get("/a")).await;
        let resp = handler.call(Request::get("/a")).await;
        assert_eq!(resp.status(), 429);
        assert!(!resp.headers().contains("X-RateLimit-Limit"));
        assert!(!resp.headers().contains("Retry-After"));
    }

    #[tokio::test]
    async fn store_calls_use_the_request_context() {
        let clock = ManualClock::new();
        let kv = Arc::new(MemoryKvStore::new(clock.shared()));
        let config = RateLimitConfig {
            distributed: true,
            default_limit: 5,
            default_window: Duration::from_secs(1),
            ..Default::default()
        };
        let limiter = Arc::new(RateLimiter::with_kv_store(config, clock.shared(), kv.clone()).unwrap());
        let handler = RateLimitLayer::new(limiter.clone()).wrap(handler_fn(|_req| async { Response::ok("ok") }));

        let ctx = Context::background();
        ctx.cancel();
        let resp = handler.call(Request::get("/a").with_context(ctx)).await;

        // Every key lookup saw the cancelled context and failed open.
        assert_eq!(resp.status(), 200);
        assert_eq!(limiter.stats().kv_errors, 2);
        assert!(kv.is_empty());

        let resp = handler.call(Request::get("/a")).await;
        assert_eq!(resp.headers().get("X-RateLimit-Remaining"), Some("4"));
        assert_eq!(limiter.stats().kv_errors, 2);
    }
}
