//! Server-side identity activation.

use crate::auth::extract;
use crate::executor::RequestExecutor;
use pupilhub_core::config::EndpointConfig;
use pupilhub_core::{HttpRequest, HubError, Result, SessionState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Makes one identity the active one on the server.
///
/// Shares session state with the authenticator. A missing switch token
/// triggers at most one re-scan of the landing page per identity for the
/// lifetime of the switcher.
pub struct IdentitySwitcher {
    executor: Arc<RequestExecutor>,
    endpoints: EndpointConfig,
    state: Arc<Mutex<SessionState>>,
    rescanned: Mutex<HashSet<String>>,
}

impl IdentitySwitcher {
    pub fn new(
        executor: Arc<RequestExecutor>,
        endpoints: EndpointConfig,
        state: Arc<Mutex<SessionState>>,
    ) -> Self {
        Self {
            executor,
            endpoints,
            state,
            rescanned: Mutex::new(HashSet::new()),
        }
    }

    /// Activates `identity_id`.
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: The identity is now active
    /// - `Ok(false)`: The server answered but did not change the active identity
    /// - `Err(HubError::UnknownIdentity)`: The id is not in the registry
    /// - `Err(HubError::Unauthorized)`: The session no longer grants access
    pub async fn switch_to(&self, identity_id: &str) -> Result<bool> {
        let token = {
            let state = self.state.lock().await;
            let identity = state
                .registry
                .get(identity_id)
                .ok_or_else(|| HubError::UnknownIdentity(identity_id.to_string()))?;
            if state.session.is_active(identity_id) {
                return Ok(true);
            }
            identity.switch_token.clone()
        };

        let token = match token {
            Some(token) => token,
            None => self.resolve_token(identity_id).await,
        };

        let response = self
            .executor
            .send(
                HttpRequest::get(self.endpoints.switch_url(&token))
                    .header("Referer", self.endpoints.landing_url())
                    .no_redirects(),
            )
            .await?;

        match response.status {
            200..=399 => {
                let mut state = self.state.lock().await;
                let SessionState { session, registry } = &mut *state;
                session.activate(identity_id, registry)?;
                tracing::info!(identity = identity_id, "Switched identity");
                Ok(true)
            }
            status @ (401 | 403) => Err(HubError::Unauthorized { status }),
            status @ 400..=499 => {
                tracing::warn!(
                    identity = identity_id,
                    status,
                    "Switch acknowledged without changing identity"
                );
                Ok(false)
            }
            status => Err(HubError::http(status, format!("switch to {identity_id} failed"))),
        }
    }

    /// Finds a switch token for an identity discovered without one, falling
    /// back to the id itself.
    async fn resolve_token(&self, identity_id: &str) -> String {
        let first_attempt = self.rescanned.lock().await.insert(identity_id.to_string());
        if first_attempt {
            match self.rescan().await {
                Ok(()) => {
                    let state = self.state.lock().await;
                    let token = state
                        .registry
                        .get(identity_id)
                        .and_then(|i| i.switch_token.clone());
                    if let Some(token) = token {
                        return token;
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Identity re-scan failed"),
            }
        }

        tracing::warn!(identity = identity_id, "No switch token found, using the identity id");
        identity_id.to_string()
    }

    async fn rescan(&self) -> Result<()> {
        let page = self.executor.execute(HttpRequest::get(self.endpoints.landing_url())).await?;
        let found = extract::scan_all_identities(&page.body);
        tracing::debug!(count = found.len(), "Re-scanned identities");
        self.state.lock().await.registry.merge(found);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use pupilhub_core::config::{MarkerConfig, TimingConfig};
    use pupilhub_core::{Identity, IdentityRegistry};

    fn switcher(transport: Arc<ScriptedTransport>, identities: Vec<Identity>) -> IdentitySwitcher {
        let executor = Arc::new(RequestExecutor::new(
            transport,
            TimingConfig::default(),
            MarkerConfig::default(),
        ));
        let mut state = SessionState::default();
        state.session.authenticated = true;
        state.registry = identities.into_iter().collect::<IdentityRegistry>();
        IdentitySwitcher::new(executor, EndpointConfig::default(), Arc::new(Mutex::new(state)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_uses_token_and_activates() {
        let transport = ScriptedTransport::new();
        transport.respond(302, "");
        let switcher = switcher(transport.clone(), vec![Identity::new("111").with_token("tok-a")]);

        assert!(switcher.switch_to("111").await.unwrap());
        assert!(switcher.state.lock().await.session.is_active("111"));
        assert_eq!(
            transport.urls(),
            vec!["https://hub.infomentor.se/Account/PupilSwitcher/SwitchPupil/tok-a"]
        );
        assert!(!transport.requests()[0].follow_redirects);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_identity_is_rejected() {
        let transport = ScriptedTransport::new();
        let switcher = switcher(transport.clone(), vec![Identity::new("111")]);

        let err = switcher.switch_to("999").await.unwrap_err();
        assert_eq!(err, HubError::UnknownIdentity("999".to_string()));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_active_needs_no_request() {
        let transport = ScriptedTransport::new();
        transport.respond(200, "");
        let switcher = switcher(transport.clone(), vec![Identity::new("111").with_token("t")]);

        assert!(switcher.switch_to("111").await.unwrap());
        assert!(switcher.switch_to("111").await.unwrap());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_happens_once_per_identity() {
        let transport = ScriptedTransport::new();
        transport.respond(200, "<html>nothing here</html>");
        transport.respond(200, "");
        transport.respond(404, "not found");
        let switcher = switcher(transport.clone(), vec![Identity::new("111")]);

        assert!(switcher.switch_to("111").await.unwrap());
        switcher.state.lock().await.session.active_identity = None;
        assert!(!switcher.switch_to("111").await.unwrap());

        let urls = transport.urls();
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0], "https://hub.infomentor.se/");
        assert!(urls[1].ends_with("/SwitchPupil/111"));
        assert!(urls[2].ends_with("/SwitchPupil/111"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_fills_missing_token() {
        let transport = ScriptedTransport::new();
        transport.respond(200, r#"<a href="/Account/PupilSwitcher/SwitchPupil/333">Alva</a>"#);
        transport.respond(200, "");
        let switcher = switcher(transport.clone(), vec![Identity::new("333").with_name("Alva")]);

        assert!(switcher.switch_to("333").await.unwrap());
        let state = switcher.state.lock().await;
        assert_eq!(state.registry.get("333").unwrap().switch_token.as_deref(), Some("333"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_switch_is_error() {
        let transport = ScriptedTransport::new();
        transport.respond(403, "");
        let switcher = switcher(transport, vec![Identity::new("111").with_token("t")]);

        let err = switcher.switch_to("111").await.unwrap_err();
        assert!(err.needs_relogin());
        assert!(!switcher.state.lock().await.session.is_active("111"));
    }
}
