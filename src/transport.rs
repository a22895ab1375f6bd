use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::{Request, Response};

use crate::body::Body;
use crate::context::AttemptContext;
use crate::error::BoxError;

pub type TransportFuture = BoxFuture<'static, Result<Response<Body>, BoxError>>;

/// Sends one attempt and yields the response head with a streaming body.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, ctx: AttemptContext, request: Request<Body>) -> TransportFuture;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, ctx: AttemptContext, request: Request<Body>) -> TransportFuture {
        (**self).send(ctx, request)
    }
}

pub struct TransportFn<F> {
    send: F,
}

/// Builds a [`Transport`] from an async closure.
pub fn transport_fn<F, Fut>(send: F) -> TransportFn<F>
where
    F: Fn(AttemptContext, Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, BoxError>> + Send + 'static,
{
    TransportFn { send }
}

impl<F, Fut> Transport for TransportFn<F>
where
    F: Fn(AttemptContext, Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, BoxError>> + Send + 'static,
{
    fn send(&self, ctx: AttemptContext, request: Request<Body>) -> TransportFuture {
        Box::pin((self.send)(ctx, request))
    }
}

#[cfg(feature = "hyper-transport")]
pub use self::hyper_transport::HyperTransport;

#[cfg(feature = "hyper-transport")]
mod hyper_transport {
    use http::Request;
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::{Connect, HttpConnector};
    use hyper_util::rt::TokioExecutor;

    use super::{Transport, TransportFuture};
    use crate::body::Body;
    use crate::context::AttemptContext;
    use crate::error::BoxError;

    /// Plain hyper client as the attempt transport.
    #[derive(Clone, Debug)]
    pub struct HyperTransport<C> {
        client: Client<C, Body>,
    }

    impl HyperTransport<HttpConnector> {
        /// HTTP/1.1 over plain TCP.
        pub fn http() -> Self {
            Self {
                client: Client::builder(TokioExecutor::new()).build_http(),
            }
        }
    }

    impl<C> HyperTransport<C>
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        pub fn new(client: Client<C, Body>) -> Self {
            Self { client }
        }
    }

    impl<C> Transport for HyperTransport<C>
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        fn send(&self, _ctx: AttemptContext, request: Request<Body>) -> TransportFuture {
            let response = self.client.request(request);
            Box::pin(async move {
                let response = response
                    .await
                    .map_err(|source| Box::new(source) as BoxError)?;
                Ok(response.map(Body::from_http_body))
            })
        }
    }
}
