use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "broadcast_service_http_requests_total",
            "Total HTTP requests handled by broadcast-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create broadcast_service_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register broadcast_service_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "broadcast_service_http_request_duration_seconds",
            "HTTP request latency for broadcast-service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create broadcast_service_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register broadcast_service_http_request_duration_seconds");
    histogram
});

static SSE_ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "broadcast_service_sse_active_sessions",
        "Live SSE sessions on this pod",
    )
    .expect("failed to create broadcast_service_sse_active_sessions");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register broadcast_service_sse_active_sessions");
    gauge
});

static BROADCASTS_CREATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "broadcast_service_broadcasts_created_total",
        "Broadcasts created through the admin surface",
    )
    .expect("failed to create broadcast_service_broadcasts_created_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register broadcast_service_broadcasts_created_total");
    counter
});

static MESSAGES_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "broadcast_service_messages_delivered_total",
        "Messages pushed to a live sink and flipped to DELIVERED",
    )
    .expect("failed to create broadcast_service_messages_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register broadcast_service_messages_delivered_total");
    counter
});

static DIRECTORY_GUARD_STATE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "broadcast_service_directory_guard_state",
        "User directory guard state (0 = serving, 1 = probing, 2 = tripped)",
    )
    .expect("failed to create broadcast_service_directory_guard_state");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register broadcast_service_directory_guard_state");
    gauge
});

static DIRECTORY_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "broadcast_service_directory_rejected_total",
            "Directory calls rejected by the guard, by reason",
        ),
        &["reason"],
    )
    .expect("failed to create broadcast_service_directory_rejected_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register broadcast_service_directory_rejected_total");
    counter
});

static DISPATCH_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "broadcast_service_dispatch_failures_total",
        "Dispatcher records routed to a dead-letter topic",
    )
    .expect("failed to create broadcast_service_dispatch_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register broadcast_service_dispatch_failures_total");
    counter
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn set_active_sessions(count: usize) {
    SSE_ACTIVE_SESSIONS.set(count as i64);
}

pub fn inc_broadcasts_created() {
    BROADCASTS_CREATED_TOTAL.inc();
}

pub fn inc_messages_delivered() {
    MESSAGES_DELIVERED_TOTAL.inc();
}

pub fn inc_dispatch_failures() {
    DISPATCH_FAILURES_TOTAL.inc();
}

pub fn set_directory_guard_state(state: i64) {
    DIRECTORY_GUARD_STATE.set(state);
}

pub fn inc_directory_rejected(reason: &str) {
    DIRECTORY_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let method = req.method().to_string();
        let path = req
            .match_pattern()
            .unwrap_or_else(|| req.path().to_string());
        let start = Instant::now();

        Box::pin(async move {
            let response = service.call(req).await?;
            observe_http_request(
                &method,
                &path,
                response.status().as_u16(),
                start.elapsed(),
            );
            Ok(response)
        })
    }
}
