//! Request execution policy.
//!
//! Every request goes through [`RequestExecutor`], which inserts the
//! politeness delay, detects the session-expired signature, and classifies
//! HTTP status codes into [`HubError`] variants. Endpoints that sometimes
//! reject GET are described with a [`VerbFallbackPlan`].

use pupilhub_core::config::{MarkerConfig, TimingConfig};
use pupilhub_core::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, HubError, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

const ERROR_SNIPPET_LEN: usize = 200;

/// Two-step plan for listing endpoints: GET first, then at most one POST.
///
/// The fallback only fires when the GET is rejected with an invalid-verb
/// signature. Parameters travel in the query string for the GET and as a
/// JSON object body for the POST.
#[derive(Debug, Clone, PartialEq)]
pub struct VerbFallbackPlan {
    url: String,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    fallback: Option<HttpMethod>,
}

impl VerbFallbackPlan {
    /// GET with a POST fallback.
    pub fn get_then_post(url: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            params,
            headers: ajax_headers(),
            fallback: Some(HttpMethod::Post),
        }
    }

    /// GET without fallback.
    pub fn get_only(url: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            fallback: None,
            ..Self::get_then_post(url, params)
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn primary_request(&self) -> HttpRequest {
        let mut request = HttpRequest::get(&self.url);
        request.headers = self.headers.clone();
        request.query = self.params.clone();
        request
    }

    /// The fallback request, when the plan has one.
    pub fn fallback_request(&self) -> Option<HttpRequest> {
        let method = self.fallback?;
        let body: Map<String, JsonValue> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect();
        let mut request = match method {
            HttpMethod::Post => HttpRequest::post(&self.url),
            HttpMethod::Get => HttpRequest::get(&self.url),
        };
        request.headers = self.headers.clone();
        request.headers.push((
            "Content-Type".to_string(),
            "application/json; charset=UTF-8".to_string(),
        ));
        Some(request.json(JsonValue::Object(body)))
    }

    /// Whether `response` to the primary request should trigger the fallback.
    pub fn should_fall_back(&self, response: &HttpResponse, markers: &MarkerConfig) -> bool {
        self.fallback.is_some()
            && !response.is_success()
            && !is_auth_status(response.status)
            && markers.is_invalid_verb(&response.body)
    }
}

fn ajax_headers() -> Vec<(String, String)> {
    vec![
        (
            "Accept".to_string(),
            "application/json, text/javascript, */*; q=0.01".to_string(),
        ),
        ("X-Requested-With".to_string(), "XMLHttpRequest".to_string()),
    ]
}

fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 403
}

/// Executes requests through the injected transport.
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    timing: TimingConfig,
    markers: MarkerConfig,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        timing: TimingConfig,
        markers: MarkerConfig,
    ) -> Self {
        Self {
            transport,
            timing,
            markers,
        }
    }

    pub fn markers(&self) -> &MarkerConfig {
        &self.markers
    }

    /// Sends a request after the politeness delay.
    ///
    /// Any status is returned as is, except that a body carrying the
    /// session-expired signature becomes [`HubError::SessionExpired`].
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        tokio::time::sleep(self.timing.request_delay()).await;

        let method = request.method;
        let url = request.url.clone();
        tracing::debug!(%method, %url, "Sending request");

        let response = self.transport.send(request).await?;
        if self.markers.is_session_expired(&response.body) {
            tracing::warn!(%url, status = response.status, "Session expired signature detected");
            return Err(HubError::session_expired(format!("{method} {url}")));
        }
        Ok(response)
    }

    /// Sends a request and classifies the status.
    ///
    /// # Returns
    ///
    /// - `Ok(HttpResponse)`: 2xx or 3xx
    /// - `Err(HubError::Unauthorized)`: 401 or 403
    /// - `Err(HubError::TransientHttp)`: Any other status
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self.send(request).await?;
        classify(response)
    }

    /// Runs a [`VerbFallbackPlan`]: the GET, then exactly one fallback
    /// request after the retry delay if the GET was rejected for its verb.
    pub async fn execute_plan(&self, plan: &VerbFallbackPlan) -> Result<HttpResponse> {
        let response = self.send(plan.primary_request()).await?;
        if !plan.should_fall_back(&response, &self.markers) {
            return classify(response);
        }

        let Some(fallback) = plan.fallback_request() else {
            return classify(response);
        };
        tracing::info!(
            url = plan.url(),
            status = response.status,
            "GET rejected for its verb, retrying as POST"
        );
        tokio::time::sleep(self.timing.retry_delay()).await;
        let response = self.send(fallback).await?;
        classify(response)
    }

    /// Runs a plan and decodes the body as JSON.
    ///
    /// A malformed body is a [`HubError::Parse`], never a network error.
    pub async fn execute_json<T: DeserializeOwned>(&self, plan: &VerbFallbackPlan) -> Result<T> {
        self.execute_plan(plan).await?.json()
    }

    /// Waits the configured retry delay.
    pub async fn retry_pause(&self) {
        tokio::time::sleep(self.timing.retry_delay()).await;
    }
}

fn classify(response: HttpResponse) -> Result<HttpResponse> {
    match response.status {
        200..=399 => Ok(response),
        status if is_auth_status(status) => Err(HubError::Unauthorized { status }),
        status => Err(HubError::http(status, snippet(&response.body))),
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(ERROR_SNIPPET_LEN) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
