//! # Telemetry module
//!
//! This module expose the operator health and its metrics over http through
//! structures, enums and helpers

use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(feature = "metrics")]
pub mod metrics;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "console_operator_server_request_success",
            "number of successful request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'console_operator_server_request_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_FAILURE: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "console_operator_server_request_failure",
            "number of failed request handled by the server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'console_operator_server_request_failure' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "console_operator_server_request_duration",
            "duration of request handled by the server",
        ),
        &["method", "path", "status", "unit"]
    )
    .expect("metrics 'console_operator_server_request_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("{0}")]
    Metrics(metrics::Error),
    #[error("failed to serialize payload, {0}")]
    Serialize(serde_json::Error),
}

// -----------------------------------------------------------------------------
// ServerError enum

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("failed to bind on socket '{0}', {1}")]
    Bind(SocketAddr, hyper::Error),
    #[error("failed to serve on socket '{0}', {1}")]
    Serve(SocketAddr, hyper::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

#[cfg_attr(feature = "trace", tracing::instrument)]
/// dispatches the request to its handler, a failing handler is answered with
/// the error as json
pub async fn router(req: Request<Body>) -> Result<Response<Body>, Error> {
    let begin = Instant::now();

    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz" | "/livez" | "/readyz") => healthz(&req).await,
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler(&req).await.map_err(Error::Metrics),
        _ => not_found(&req).await,
    };

    let (res, success) = match result {
        Ok(res) => (res, true),
        Err(err) => (failure(&err)?, false),
    };

    observe(&req, &res, success, begin.elapsed().as_micros());
    Ok(res)
}

/// formats the error in a json document
fn failure(err: &Error) -> Result<Response<Body>, Error> {
    let map = BTreeMap::from([("error".to_string(), err.to_string())]);
    let mut res = Response::default();

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    *res.body_mut() = Body::from(serde_json::to_string_pretty(&map).map_err(Error::Serialize)?);

    Ok(res)
}

/// emits the access log and the request counters
fn observe(req: &Request<Body>, res: &Response<Body>, success: bool, duration: u128) {
    let host = match req.uri().host() {
        Some(host) => host.to_string(),
        None => req
            .headers()
            .get(header::HOST)
            .map(|header| String::from_utf8_lossy(header.as_bytes()).to_string())
            .unwrap_or_else(|| String::from("<none>")),
    };

    let status = res.status().as_u16().to_string();

    info!(
        method = req.method().as_str(),
        host = host,
        path = req.uri().path(),
        status = &status,
        duration = duration,
        "Receive request"
    );

    #[cfg(feature = "metrics")]
    {
        let labels = [req.method().as_str(), req.uri().path(), status.as_str()];
        if success {
            SERVER_REQUEST_SUCCESS.with_label_values(&labels).inc();
        } else {
            SERVER_REQUEST_FAILURE.with_label_values(&labels).inc();
        }

        SERVER_REQUEST_DURATION
            .with_label_values(&[labels[0], labels[1], labels[2], "us"])
            .inc_by(duration as f64);
    }

    #[cfg(not(feature = "metrics"))]
    let _ = success;
}

#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn healthz(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NO_CONTENT;

    Ok(res)
}

#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn not_found(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let mut res = Response::default();

    *res.status_mut() = StatusCode::NOT_FOUND;

    Ok(res)
}

#[cfg_attr(feature = "trace", tracing::instrument(skip(cancel)))]
/// serves the [`router`] on the given address until the token is cancelled
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<(), ServerError> {
    let server = Server::try_bind(&addr)
        .map_err(|err| ServerError::Bind(addr, err))?
        .serve(make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(router))
        }));

    info!(addr = addr.to_string(), "Begin to listen on address");
    server
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| ServerError::Serve(addr, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .expect("request to be valid")
    }

    #[tokio::test]
    async fn probes_answer_no_content() {
        for path in ["/healthz", "/livez", "/readyz"] {
            let res = router(get(path)).await.expect("router to answer");
            assert_eq!(res.status(), StatusCode::NO_CONTENT, "path {path}");
        }
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let res = router(get("/console")).await.expect("router to answer");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = router(
            Request::builder()
                .method(Method::POST)
                .uri("/healthz")
                .body(Body::empty())
                .expect("request to be valid"),
        )
        .await
        .expect("router to answer");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn metrics_are_exposed_in_text_format() {
        let _ = router(get("/healthz")).await.expect("router to answer");

        let res = router(get("/metrics")).await.expect("router to answer");
        assert_eq!(res.status(), StatusCode::OK);

        let body = hyper::body::to_bytes(res.into_body())
            .await
            .expect("body to be readable");
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains("console_operator_server_request_success"));
    }
}
