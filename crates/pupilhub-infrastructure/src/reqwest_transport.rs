//! [`HttpTransport`] backed by `reqwest`.
//!
//! Two clients share one cookie jar: one follows redirects, the other
//! returns 3xx responses untouched so the login flow can read `Location`.

use async_trait::async_trait;
use pupilhub_core::config::TimingConfig;
use pupilhub_core::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, HubError, RequestBody, Result,
};
use reqwest::cookie::Jar;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue, PRAGMA,
};
use reqwest::redirect::Policy;
use std::sync::Arc;

pub struct ReqwestTransport {
    following: reqwest::Client,
    manual: reqwest::Client,
    jar: Arc<Jar>,
}

impl ReqwestTransport {
    /// Builds both clients from the timing section of the config.
    pub fn new(timing: &TimingConfig) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let following = Self::builder(timing, jar.clone())
            .redirect(Policy::limited(10))
            .build()
            .map_err(|e| HubError::config(format!("Failed to build HTTP client: {e}")))?;
        let manual = Self::builder(timing, jar.clone())
            .redirect(Policy::none())
            .build()
            .map_err(|e| HubError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            following,
            manual,
            jar,
        })
    }

    /// The shared cookie jar.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    fn builder(timing: &TimingConfig, jar: Arc<Jar>) -> reqwest::ClientBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("sv-SE,sv;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        reqwest::Client::builder()
            .cookie_provider(jar)
            .default_headers(headers)
            .user_agent(timing.user_agent.clone())
            .timeout(timing.request_timeout())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let client = if request.follow_redirects {
            &self.following
        } else {
            &self.manual
        };

        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };

        let mut builder = client.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HubError::internal(format!("Invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HubError::internal(format!("Invalid header value: {e}")))?;
            builder = builder.header(name, value);
        }
        builder = match &request.body {
            Some(RequestBody::Form(pairs)) => builder.form(pairs),
            Some(RequestBody::Json(value)) => builder.json(value),
            None => builder,
        };

        let response = builder.send().await.map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(map_transport_error)?;

        tracing::trace!(status, %url, "HTTP response received");
        Ok(HttpResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

/// Timeouts and unreachable hosts both surface as connection errors.
fn map_transport_error(err: reqwest::Error) -> HubError {
    if err.is_timeout() {
        HubError::timeout(err.to_string())
    } else {
        HubError::connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let timing = TimingConfig {
            request_timeout_secs: 2,
            ..TimingConfig::default()
        };
        let transport = ReqwestTransport::new(&timing).unwrap();

        // Port 9 (discard) on localhost is closed on test machines.
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            transport.send(HttpRequest::get("http://127.0.0.1:9/")),
        )
        .await
        .unwrap();

        assert!(result.unwrap_err().is_connection());
    }
}
