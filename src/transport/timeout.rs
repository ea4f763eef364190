//! Timeout layer for RPC requests.

use crate::metrics::TransportMetrics;
use alloy::{
    primitives::ChainId,
    rpc::json_rpc::{RequestPacket, ResponsePacket},
    transports::{Transport, TransportError, TransportErrorKind, TransportFut},
};
use futures::FutureExt;
use std::{
    task::{Context, Poll},
    time::Duration,
};
use tower::{Layer, Service};
use tracing::warn;
use url::Url;

/// A [`tower::Layer`] that bounds every request sent to a single endpoint.
///
/// An elapsed request resolves to a transport error, which the
/// [`FailoverService`](super::FailoverService) treats like an unreachable endpoint.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    timeout: Duration,
    chain_id: ChainId,
    endpoint: Url,
    metrics: TransportMetrics,
}

impl TimeoutLayer {
    /// Create a new [`TimeoutLayer`] for the given endpoint of a chain.
    pub fn new(timeout: Duration, chain_id: ChainId, endpoint: Url) -> Self {
        Self { timeout, chain_id, endpoint, metrics: TransportMetrics::for_chain(chain_id) }
    }
}

impl<T> Layer<T> for TimeoutLayer {
    type Service = TimeoutService<T>;

    fn layer(&self, inner: T) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
            chain_id: self.chain_id,
            endpoint: self.endpoint.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// A service that wraps another service with a timeout.
#[derive(Debug, Clone)]
pub struct TimeoutService<T> {
    inner: T,
    timeout: Duration,
    chain_id: ChainId,
    endpoint: Url,
    metrics: TransportMetrics,
}

impl<T> Service<RequestPacket> for TimeoutService<T>
where
    T: Transport + Clone,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = TransportFut<'static>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        let method = req.as_single().map(|r| r.method()).unwrap_or("batch").to_string();

        let fut = self.inner.call(req);
        let timeout = self.timeout;
        let chain_id = self.chain_id;
        let endpoint = self.endpoint.host_str().unwrap_or_default().to_string();
        let metrics = self.metrics.clone();

        async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => {
                    metrics.request_timeouts.increment(1);
                    warn!(
                        %chain_id,
                        %method,
                        %endpoint,
                        timeout_ms = timeout.as_millis() as u64,
                        "RPC request timeout"
                    );
                    Err(TransportErrorKind::custom_str(&format!(
                        "request timeout: chain_id={chain_id}, method={method}, endpoint={endpoint}"
                    )))
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{request_fn, success_response};
    use alloy::rpc::json_rpc::{Id, Request, SerializedRequest};

    fn packet(method: &'static str) -> RequestPacket {
        let request = Request::new(method, Id::Number(1), ());
        RequestPacket::from(SerializedRequest::try_from(request).unwrap())
    }

    #[tokio::test]
    async fn slow_requests_become_transport_errors() {
        let slow = request_fn(|req: RequestPacket| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(success_response(&req, &1u64))
            })
        });
        let mut service = TimeoutLayer::new(
            Duration::from_millis(20),
            1,
            "http://localhost:8545".parse().unwrap(),
        )
        .layer(slow);

        let err = service.call(packet("eth_blockNumber")).await.unwrap_err();
        assert!(err.is_transport_error());
        assert!(err.to_string().contains("eth_blockNumber"));
    }

    #[tokio::test]
    async fn fast_requests_pass_through() {
        let fast = request_fn(|req: RequestPacket| {
            Box::pin(async move { Ok(success_response(&req, &1u64)) })
        });
        let mut service = TimeoutLayer::new(
            Duration::from_secs(1),
            1,
            "http://localhost:8545".parse().unwrap(),
        )
        .layer(fast);

        assert!(service.call(packet("eth_chainId")).await.is_ok());
    }
}
