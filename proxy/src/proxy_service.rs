use crate::ProxyBody;
use crate::errors::ProxyError;
use crate::router::Router;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

/// Client-facing service, one per accepted connection.
pub struct ProxyService {
    router: Arc<Router>,
    client_addr: SocketAddr,
}

impl ProxyService {
    pub fn new(router: Arc<Router>, client_addr: SocketAddr) -> Self {
        Self {
            router,
            client_addr,
        }
    }
}

impl HyperService<Request<Incoming>> for ProxyService {
    type Response = Response<ProxyBody>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let router = self.router.clone();
        let client_addr = self.client_addr;

        Box::pin(async move { Ok(router.handle(req.map(|body| body.boxed()), client_addr).await) })
    }
}
