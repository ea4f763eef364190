//! Sticky failover across the endpoints of a chain.

use crate::metrics::TransportMetrics;
use alloy::{
    primitives::ChainId,
    rpc::json_rpc::{RequestPacket, ResponsePacket},
    transports::{BoxTransport, TransportError, TransportErrorKind, TransportFut},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};
use tower::Service;
use tracing::{debug, warn};

/// A transport over an ordered list of endpoints of the same chain.
///
/// Requests go to the active endpoint. When it fails at the transport level (connection errors,
/// timeouts), the request is retried on the following endpoints in configured order, and the
/// first endpoint that answers becomes the active one for every clone of this service. JSON-RPC
/// error responses are returned as is: the node was reachable and answered.
///
/// The active endpoint only moves forward on failure, it is never rotated, so consecutive fee,
/// nonce and receipt queries observe the same node while it stays healthy.
#[derive(Debug, Clone)]
pub struct FailoverService {
    chain_id: ChainId,
    endpoints: Arc<Vec<BoxTransport>>,
    active: Arc<AtomicUsize>,
    metrics: TransportMetrics,
}

impl FailoverService {
    /// Creates a new [`FailoverService`]. The first endpoint is active.
    ///
    /// `endpoints` must not be empty.
    pub fn new(chain_id: ChainId, endpoints: Vec<BoxTransport>) -> Self {
        Self {
            chain_id,
            endpoints: Arc::new(endpoints),
            active: Arc::default(),
            metrics: TransportMetrics::for_chain(chain_id),
        }
    }

    /// Returns the index of the active endpoint.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Service<RequestPacket> for FailoverService {
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = TransportFut<'static>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Endpoints are polled for readiness right before they are called.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        let this = self.clone();

        Box::pin(async move {
            let count = this.endpoints.len();
            let start = this.active();
            let mut last_error = None;

            for offset in 0..count {
                let idx = (start + offset) % count;
                let mut endpoint = this.endpoints[idx].clone();

                let result = match std::future::poll_fn(|cx| endpoint.poll_ready(cx)).await {
                    Ok(()) => endpoint.call(req.clone()).await,
                    Err(err) => Err(err),
                };

                match result {
                    Ok(response) => {
                        if idx != start
                            && this
                                .active
                                .compare_exchange(start, idx, Ordering::AcqRel, Ordering::Acquire)
                                .is_ok()
                        {
                            this.metrics.failovers.increment(1);
                            warn!(chain_id = %this.chain_id, from = start, to = idx, "Switched active endpoint");
                        }
                        return Ok(response);
                    }
                    Err(err) => {
                        debug!(chain_id = %this.chain_id, endpoint = idx, %err, "Endpoint failed");
                        last_error = Some(err);
                    }
                }
            }

            Err(last_error.unwrap_or_else(|| {
                TransportErrorKind::custom_str(&format!(
                    "no endpoints configured for chain {}",
                    this.chain_id
                ))
            }))
        })
    }
}
