//! # Metrics module
//!
//! This module exports the operator counters using the prometheus text format

use hyper::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Body, Request, Response, StatusCode,
};
use prometheus::{Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to encode metrics, {0}")]
    Encode(prometheus::Error),
    #[error("failed to build header from encoder format, {0}")]
    Header(InvalidHeaderValue),
}

// -----------------------------------------------------------------------------
// Helper methods

/// returns the metric families registered in the default registry, encoded
/// along with their content type
pub fn encode() -> Result<(String, Vec<u8>), Error> {
    let encoder = TextEncoder::new();
    let mut buf = vec![];

    encoder
        .encode(&prometheus::gather(), &mut buf)
        .map_err(Error::Encode)?;

    Ok((encoder.format_type().to_string(), buf))
}

#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn handler(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let (format, buf) = encode()?;
    let mut res = Response::default();

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&format).map_err(Error::Header)?,
    );
    res.headers_mut().insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&buf.len().to_string()).map_err(Error::Header)?,
    );

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(buf);

    Ok(res)
}
