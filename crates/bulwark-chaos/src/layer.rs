use std::sync::Arc;

use async_trait::async_trait;
use bulwark_http::{BoxHandler, Handler, Middleware, Request, Response};

use crate::injector::FaultInjector;

/// Sits between the rate limiter and the handler.
#[derive(Clone)]
pub struct ChaosLayer {
    injector: Arc<FaultInjector>,
}

impl ChaosLayer {
    pub fn new(injector: Arc<FaultInjector>) -> Self {
        Self { injector }
    }

    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }
}

impl Middleware for ChaosLayer {
    fn wrap(&self, inner: BoxHandler) -> BoxHandler {
        Arc::new(Chaotic {
            injector: Arc::clone(&self.injector),
            inner,
        })
    }
}

struct Chaotic {
    injector: Arc<FaultInjector>,
    inner: BoxHandler,
}

#[async_trait]
impl Handler for Chaotic {
    async fn call(&self, req: Request) -> Response {
        self.injector.handle(req, self.inner.as_ref()).await
    }
}
