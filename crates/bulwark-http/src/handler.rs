use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::request::Request;
use crate::response::Response;

/// Anything that turns a request into a response.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: Request) -> Response;
}

pub type BoxHandler = Arc<dyn Handler>;

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Response> + Send,
{
    async fn call(&self, req: Request) -> Response {
        (self.0)(req).await
    }
}

/// Lift an async closure into a [`BoxHandler`].
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// An interceptor: `wrap(inner) -> wrapped`.
pub trait Middleware: Send + Sync {
    fn wrap(&self, inner: BoxHandler) -> BoxHandler;
}

/// Ordered middleware list; the first pushed layer is the outermost.
#[derive(Default, Clone)]
pub struct Stack {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(mut self, layer: Arc<dyn Middleware>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn build(&self, inner: BoxHandler) -> BoxHandler {
        self.layers
            .iter()
            .rev()
            .fold(inner, |handler, layer| layer.wrap(handler))
    }
}
