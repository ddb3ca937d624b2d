//! In-memory fetchers for strategy and dispatcher tests.

use crate::fetch::{Fetch, FetchError, FetchRequest, FetchResponse};
use async_trait::async_trait;
use http::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Serves one fixed body with a fixed status.
pub struct StaticFetcher {
    status: StatusCode,
    body: String,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(body: &str) -> Self {
        Self::with_status(StatusCode::OK, body)
    }

    pub fn with_status(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for StaticFetcher {
    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = FetchResponse::ok(self.body.clone());
        response.status = self.status;
        Ok(response)
    }
}

/// Always fails with a transport error.
pub struct FailingFetcher;

#[async_trait]
impl Fetch for FailingFetcher {
    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        Err(FetchError::Network("connection refused".to_string()))
    }
}

/// Never resolves; proves a code path did not await the network.
#[derive(Default)]
pub struct PendingFetcher;

#[async_trait]
impl Fetch for PendingFetcher {
    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        std::future::pending().await
    }
}

/// Serves queued bodies in order, then fails once drained.
pub struct SequenceFetcher {
    bodies: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl SequenceFetcher {
    pub fn new(bodies: &[&str]) -> Self {
        Self {
            bodies: Mutex::new(bodies.iter().map(|b| b.to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for SequenceFetcher {
    async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .bodies
            .lock()
            .expect("sequence lock poisoned")
            .pop_front();
        match next {
            Some(body) => Ok(FetchResponse::ok(body)),
            None => Err(FetchError::Network("sequence drained".to_string())),
        }
    }
}
