//! Scripted transport for testing
//!
//! Responses are registered per URL prefix and handed out in order; the last
//! response registered for a prefix keeps repeating once the others are
//! used up. Every request is recorded together with the time on an optional
//! [`VirtualClock`], so tests can assert how long an adapter waited between
//! two calls without really sleeping.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::FetchError;
use crate::pacing::VirtualClock;
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// A request as seen by the mock
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: HttpRequest,
    /// Virtual time at which the request was issued
    pub at: Duration,
}

struct Route {
    prefix: String,
    responses: VecDeque<HttpResponse>,
}

#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    clock: Option<VirtualClock>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp recorded requests with this clock
    pub fn with_clock(clock: VirtualClock) -> Self {
        Self {
            clock: Some(clock),
            ..Self::default()
        }
    }

    /// Queue a response for URLs starting with `prefix`
    pub fn on(&self, prefix: &str, response: HttpResponse) -> &Self {
        if let Ok(mut routes) = self.routes.lock() {
            match routes.iter_mut().find(|r| r.prefix == prefix) {
                Some(route) => route.responses.push_back(response),
                None => routes.push(Route {
                    prefix: prefix.to_string(),
                    responses: VecDeque::from([response]),
                }),
            }
        }
        self
    }

    /// Queue a 200 JSON response
    pub fn on_json(&self, prefix: &str, body: serde_json::Value) -> &Self {
        self.on(prefix, HttpResponse::new(200, body.to_string()))
    }

    /// Queue a 200 HTML/text response
    pub fn on_text(&self, prefix: &str, body: &str) -> &Self {
        self.on(prefix, HttpResponse::new(200, body))
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// URLs requested so far, in order
    pub fn urls(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.request.url)
            .collect()
    }

    /// Requests whose URL starts with `prefix`
    pub fn requests_to(&self, prefix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.request.url.starts_with(prefix))
            .collect()
    }

    fn next_response(&self, url: &str) -> Option<HttpResponse> {
        let mut routes = self.routes.lock().ok()?;
        let route = routes
            .iter_mut()
            .filter(|r| url.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())?;

        if route.responses.len() > 1 {
            route.responses.pop_front()
        } else {
            route.responses.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let at = self.clock.as_ref().map(|c| c.now()).unwrap_or_default();
        let url = request.url.clone();

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest { request, at });
        }

        match self.next_response(&url) {
            Some(response) => Ok(response),
            None => Err(FetchError::Network(format!("no mock route for {}", url))),
        }
    }
}
