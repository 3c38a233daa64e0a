//! Tower middleware that gates every request through the [`Engine`].

use futures::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

use super::{describe, REASON_HEADER};
use crate::admission::{Outcome, TransportKind};
use crate::engine::Engine;
use crate::error::Rejection;

const GRPC_STATUS_HEADER: &str = "grpc-status";
const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Applies admission control to an HTTP or gRPC service.
#[derive(Clone)]
pub struct AdmissionLayer {
    engine: Arc<Engine>,
    transport: TransportKind,
}

impl AdmissionLayer {
    /// Layer for request/response services: rejections become `429`.
    pub fn http(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            transport: TransportKind::Http,
        }
    }

    /// Layer for gRPC services: rejections become `RESOURCE_EXHAUSTED`.
    pub fn grpc(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            transport: TransportKind::Grpc,
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            engine: Arc::clone(&self.engine),
            transport: self.transport,
        }
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    engine: Arc<Engine>,
    transport: TransportKind,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for AdmissionService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<ReqBody>) -> Self::Future {
        let descriptor = describe(self.transport, &request);
        let admission = match self.engine.admit(&descriptor) {
            Ok(admission) => admission,
            Err(rejection) => {
                let response = rejection_response(self.transport, rejection);
                return Box::pin(async move { Ok(response) });
            }
        };

        let transport = self.transport;
        let future = self.inner.call(request);
        Box::pin(async move {
            // a dropped future drops the admission, which counts as a failure
            let result = future.await;
            let outcome = match &result {
                Ok(response) => classify(transport, response),
                Err(_) => Outcome::Failure,
            };
            admission.complete(outcome);
            result
        })
    }
}

/// Outcome of a completed handler, judged from its response head.
fn classify<B>(transport: TransportKind, response: &http::Response<B>) -> Outcome {
    if response.status().is_server_error() {
        return Outcome::Failure;
    }
    if transport == TransportKind::Grpc {
        let failed = response
            .headers()
            .get(GRPC_STATUS_HEADER)
            .is_some_and(|status| status.as_bytes() != b"0");
        if failed {
            return Outcome::Failure;
        }
    }
    Outcome::Success
}

fn rejection_response<B: Default>(transport: TransportKind, rejection: Rejection) -> http::Response<B> {
    let mut response = http::Response::new(B::default());
    match transport {
        TransportKind::Http => {
            *response.status_mut() = rejection.http_status();
            response.headers_mut().insert(
                REASON_HEADER,
                HeaderValue::from_static(rejection.reason_code()),
            );
        }
        TransportKind::Grpc => {
            // trailers-only: status travels in the response headers
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
            let status = tonic::Status::from(rejection);
            if let Err(e) = status.add_header(response.headers_mut()) {
                warn!(error = %e, "Failed to encode gRPC rejection status");
                response.headers_mut().insert(
                    GRPC_STATUS_HEADER,
                    HeaderValue::from(tonic::Code::ResourceExhausted as i32),
                );
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdaptiveLimiter, AdmissionPipeline};
    use crate::config::{AdmissionConfig, KeyBy, QuotaOrder};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    fn engine(inflight_max: i64) -> Arc<Engine> {
        let config = AdmissionConfig {
            inflight_max,
            rate_rps: 0.0,
            rate_burst: 0,
            key_by: KeyBy::Global,
        };
        let pipeline = AdmissionPipeline::new(&config, Arc::new(AdaptiveLimiter::disabled()));
        Arc::new(Engine::new(pipeline, None, QuotaOrder::After))
    }

    fn request(path: &str) -> http::Request<String> {
        http::Request::builder().uri(path).body(String::new()).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_request_reaches_handler() {
        let engine = engine(1);
        let service = AdmissionLayer::http(Arc::clone(&engine)).layer(service_fn(
            |_req: http::Request<String>| async { Ok::<_, Infallible>(http::Response::new("ok".to_string())) },
        ));

        let response = service.oneshot(request("/v1/items")).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.body(), "ok");
        assert_eq!(engine.pipeline().gate().unwrap().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_http_rejection_skips_handler() {
        let engine = engine(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let service = AdmissionLayer::http(Arc::clone(&engine)).layer(service_fn(
            move |_req: http::Request<String>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Infallible>(http::Response::new(String::new())) }
            },
        ));

        let _held = engine
            .admit(&describe(TransportKind::Http, &request("/v1/items")))
            .unwrap();
        let response = service.oneshot(request("/v1/items")).await.unwrap();

        assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[REASON_HEADER], "RATE_LIMITED");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_grpc_rejection_is_trailers_only() {
        let engine = engine(1);
        let service = AdmissionLayer::grpc(Arc::clone(&engine)).layer(service_fn(
            |_req: http::Request<String>| async { Ok::<_, Infallible>(http::Response::new(String::new())) },
        ));

        let _held = engine
            .admit(&describe(TransportKind::Grpc, &request("/pkg.Svc/Call")))
            .unwrap();
        let response = service.oneshot(request("/pkg.Svc/Call")).await.unwrap();

        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/grpc");
        assert_eq!(response.headers()["grpc-status"], "8");
        assert_eq!(response.headers()[REASON_HEADER], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_handler_error_releases_slot() {
        let engine = engine(1);
        let service = AdmissionLayer::http(Arc::clone(&engine)).layer(service_fn(
            |_req: http::Request<String>| async { Err::<http::Response<String>, _>("handler failed") },
        ));

        let err = service.oneshot(request("/v1/items")).await.unwrap_err();
        assert_eq!(err, "handler failed");
        assert_eq!(engine.pipeline().gate().unwrap().in_flight(), 0);
    }

    #[test]
    fn test_classify() {
        let ok = http::Response::new(());
        assert_eq!(classify(TransportKind::Http, &ok), Outcome::Success);

        let unavailable = http::Response::builder().status(503).body(()).unwrap();
        assert_eq!(classify(TransportKind::Http, &unavailable), Outcome::Failure);

        let grpc_error = http::Response::builder()
            .header("grpc-status", "14")
            .body(())
            .unwrap();
        assert_eq!(classify(TransportKind::Grpc, &grpc_error), Outcome::Failure);
        assert_eq!(classify(TransportKind::Http, &grpc_error), Outcome::Success);

        let grpc_ok = http::Response::builder()
            .header("grpc-status", "0")
            .body(())
            .unwrap();
        assert_eq!(classify(TransportKind::Grpc, &grpc_ok), Outcome::Success);
    }
}
