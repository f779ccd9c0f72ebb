//! Gzip with a per-extension opt-out.
//!
//! The compression layer only sees responses, so [`mark_excluded`] runs
//! inside it and tags responses for excluded paths with [`SkipCompression`].

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Extensions, HeaderMap, Request, StatusCode, Version},
    middleware::Next,
    response::Response,
};
use tower_http::compression::{
    CompressionLayer, Predicate,
    predicate::{DefaultPredicate, NotForContentType},
};

/// Response extension disabling compression.
#[derive(Debug, Clone, Copy)]
pub struct SkipCompression;

#[derive(Debug, Clone)]
pub struct ExcludedExtensions(Arc<Vec<String>>);

impl ExcludedExtensions {
    pub fn new(extensions: &[String]) -> Self {
        Self(Arc::new(
            extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
        ))
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        self.0.iter().any(|ext| path.ends_with(ext.as_str()))
    }
}

pub async fn mark_excluded(
    State(excluded): State<ExcludedExtensions>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let skip = excluded.matches(req.uri().path());
    let mut response = next.run(req).await;
    if skip {
        response.extensions_mut().insert(SkipCompression);
    }
    response
}

fn not_marked(_: StatusCode, _: Version, _: &HeaderMap, extensions: &Extensions) -> bool {
    extensions.get::<SkipCompression>().is_none()
}

pub fn layer() -> CompressionLayer<impl Predicate> {
    CompressionLayer::new().gzip(true).compress_when(
        DefaultPredicate::new()
            .and(NotForContentType::const_new("text/event-stream"))
            .and(not_marked as fn(StatusCode, Version, &HeaderMap, &Extensions) -> bool),
    )
}
