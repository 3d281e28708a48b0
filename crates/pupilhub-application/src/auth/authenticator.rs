use super::extract::{self, Discovery};
use crate::executor::RequestExecutor;
use pupilhub_core::config::EndpointConfig;
use pupilhub_core::{
    HttpRequest, HttpResponse, HubError, Identity, Result, SchoolHints, SchoolOption, Session,
    SessionState, choose,
};
use reqwest::Url;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Username and password for the legacy credential form.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// How identity discovery ended.
///
/// An account with no dependents is `Empty`, which is distinct from the
/// landing page failing to load.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityDiscovery {
    Found { count: usize },
    Empty,
    Failed(HubError),
}

/// Result of a completed login.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
    pub identities: Vec<Identity>,
    pub discovery: IdentityDiscovery,
    /// Login target picked during school selection, if one was offered.
    pub school: Option<SchoolOption>,
}

enum LoginStep {
    InitialRedirect,
    TokenAcquisition { target: String },
    CredentialSubmission { token: String, form: Option<HttpResponse> },
    SchoolSelection { token: String, options: Vec<SchoolOption> },
    OAuthCompletion { token: String },
    IdentityDiscovery,
}

impl LoginStep {
    fn name(&self) -> &'static str {
        match self {
            LoginStep::InitialRedirect => "initial_redirect",
            LoginStep::TokenAcquisition { .. } => "token_acquisition",
            LoginStep::CredentialSubmission { .. } => "credential_submission",
            LoginStep::SchoolSelection { .. } => "school_selection",
            LoginStep::OAuthCompletion { .. } => "oauth_completion",
            LoginStep::IdentityDiscovery => "identity_discovery",
        }
    }
}

enum CredentialOutcome {
    Accepted,
    SchoolChoice(Vec<SchoolOption>),
}

#[derive(Default)]
struct LoginGate {
    last: Option<Result<LoginOutcome>>,
}

/// Drives the multi-domain login walk and owns the session it produces.
///
/// At most one walk runs at a time. A caller that arrives while a walk is in
/// flight waits for it and receives its result instead of starting a second
/// walk over the same cookie jar.
pub struct SessionAuthenticator {
    executor: Arc<RequestExecutor>,
    endpoints: EndpointConfig,
    state: Arc<Mutex<SessionState>>,
    gate: Mutex<LoginGate>,
    generation: AtomicU64,
}

impl SessionAuthenticator {
    pub fn new(executor: Arc<RequestExecutor>, endpoints: EndpointConfig) -> Self {
        Self {
            executor,
            endpoints,
            state: Arc::new(Mutex::new(SessionState::default())),
            gate: Mutex::new(LoginGate::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Shared session state, also mutated by the identity switcher.
    pub fn state(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }

    pub async fn session(&self) -> Session {
        self.state.lock().await.session.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.session.authenticated
    }

    /// Runs the login walk.
    ///
    /// # Returns
    ///
    /// - `Ok(LoginOutcome)`: Session authenticated; identities merged into the registry
    /// - `Err(HubError::Auth)`: Credentials rejected or the walk could not finish
    /// - `Err(HubError::Connection)`: The portal was unreachable
    pub async fn login(
        &self,
        credentials: &Credentials,
        hints: &SchoolHints,
    ) -> Result<LoginOutcome> {
        let observed = self.generation.load(Ordering::Acquire);
        let mut gate = self.gate.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(last) = gate.last.clone() {
                tracing::debug!(target: "pupilhub::auth", "Joined the login that was in flight");
                return last;
            }
        }

        self.state.lock().await.session.reset();
        tracing::info!(
            target: "pupilhub::auth",
            username = credentials.username(),
            "Starting login"
        );

        let result = self.walk(credentials, hints).await.map_err(into_login_error);
        match &result {
            Ok(outcome) => {
                let mut state = self.state.lock().await;
                state.session.authenticated = true;
                state.session.active_identity = None;
                state.registry.merge(outcome.identities.iter().cloned());
                tracing::info!(
                    target: "pupilhub::auth",
                    identities = state.registry.len(),
                    "Login complete"
                );
            }
            Err(e) => tracing::warn!(target: "pupilhub::auth", error = %e, "Login failed"),
        }

        gate.last = Some(result.clone());
        self.generation.fetch_add(1, Ordering::Release);
        result
    }

    async fn walk(&self, credentials: &Credentials, hints: &SchoolHints) -> Result<LoginOutcome> {
        let mut restarted = false;
        let mut school_attempted = false;
        let mut school = None;
        let mut step = LoginStep::InitialRedirect;

        loop {
            tracing::debug!(target: "pupilhub::auth", step = step.name(), "Login step");
            step = match step {
                LoginStep::InitialRedirect => LoginStep::TokenAcquisition {
                    target: self.initial_redirect().await?,
                },
                LoginStep::TokenAcquisition { target } => LoginStep::CredentialSubmission {
                    token: self.acquire_token(&target).await?,
                    form: None,
                },
                LoginStep::CredentialSubmission { token, form } => {
                    match self.submit_credentials(credentials, &token, form).await? {
                        CredentialOutcome::SchoolChoice(options) => {
                            LoginStep::SchoolSelection { token, options }
                        }
                        CredentialOutcome::Accepted => {
                            self.decline_pin().await;
                            LoginStep::OAuthCompletion { token }
                        }
                    }
                }
                LoginStep::SchoolSelection { token, options } => {
                    if school_attempted {
                        return Err(HubError::auth(
                            "School selection offered again after a school was chosen",
                        ));
                    }
                    school_attempted = true;

                    let selection = choose(&options, hints)
                        .ok_or_else(|| HubError::auth("School selection offered no options"))?;
                    tracing::info!(
                        target: "pupilhub::auth",
                        school = %selection.chosen.label,
                        candidates = selection.scored.len(),
                        "Submitting school selection"
                    );
                    let page = self
                        .executor
                        .execute(HttpRequest::get(&selection.chosen.login_url))
                        .await?;
                    school = Some(selection.chosen);

                    if extract::has_credential_form(&page.body) {
                        LoginStep::CredentialSubmission { token, form: Some(page) }
                    } else {
                        LoginStep::OAuthCompletion { token }
                    }
                }
                LoginStep::OAuthCompletion { token } => match self.complete_oauth(&token).await {
                    Ok(()) => LoginStep::IdentityDiscovery,
                    Err(e) if e.is_session_expired() && !restarted => {
                        tracing::warn!(
                            target: "pupilhub::auth",
                            "Session expired during OAuth completion, restarting once"
                        );
                        restarted = true;
                        school_attempted = false;
                        LoginStep::InitialRedirect
                    }
                    Err(e) if e.is_session_expired() => {
                        return Err(HubError::auth(
                            "Session expired again after restarting the login",
                        ));
                    }
                    Err(e) => return Err(e),
                },
                LoginStep::IdentityDiscovery => {
                    let (identities, discovery) = self.discover_identities().await;
                    return Ok(LoginOutcome {
                        identities,
                        discovery,
                        school,
                    });
                }
            };
        }
    }

    /// Requests the entry URL and returns where it points.
    async fn initial_redirect(&self) -> Result<String> {
        let entry = self.endpoints.hub_base_url.clone();
        let response = self.executor.send(HttpRequest::get(&entry).no_redirects()).await?;

        if response.is_redirect() {
            if let Some(location) = response.location() {
                return resolve_url(&entry, location);
            }
        }
        if response.is_success() {
            if let Some(target) = extract::script_redirect(&response.body) {
                tracing::debug!(target: "pupilhub::auth", "Entry page redirects via script");
                return resolve_url(&entry, &target);
            }
        }
        Err(HubError::connection(format!(
            "Entry URL answered HTTP {} without a redirect",
            response.status
        )))
    }

    async fn acquire_token(&self, target: &str) -> Result<String> {
        let page = self.executor.execute(HttpRequest::get(target)).await?;
        match extract::oauth_token(&page.body) {
            Discovery::Found { extractor, value } => {
                tracing::debug!(
                    target: "pupilhub::auth",
                    extractor,
                    token = %token_prefix(&value),
                    "OAuth token found"
                );
                Ok(value)
            }
            Discovery::NoMatch => Err(HubError::auth("OAuth token not found on the login page")),
        }
    }

    /// Posts the token (unless a form page is already in hand), then the
    /// credentials with the page's hidden form state.
    async fn submit_credentials(
        &self,
        credentials: &Credentials,
        token: &str,
        form: Option<HttpResponse>,
    ) -> Result<CredentialOutcome> {
        let legacy = &self.endpoints.legacy_login_url;

        let form = match form {
            Some(page) => page,
            None => {
                let page = self
                    .executor
                    .execute(
                        HttpRequest::post(legacy)
                            .header("Origin", &self.endpoints.hub_base_url)
                            .form([("oauth_token", token)]),
                    )
                    .await?;
                let options = extract::school_options(&page.body);
                if options.len() >= 2 {
                    return Ok(CredentialOutcome::SchoolChoice(options));
                }
                if extract::has_credential_form(&page.body) {
                    page
                } else {
                    self.executor.execute(HttpRequest::get(legacy)).await?
                }
            }
        };

        let mut fields = vec![
            ("__EVENTTARGET".to_string(), extract::LOGIN_EVENT_TARGET.to_string()),
            ("__EVENTARGUMENT".to_string(), String::new()),
        ];
        fields.extend(extract::form_state(&form.body));
        fields.push((extract::USERNAME_FIELD.to_string(), credentials.username.clone()));
        fields.push((extract::PASSWORD_FIELD.to_string(), credentials.password.clone()));

        let post_url = if form.url.is_empty() { legacy.clone() } else { form.url.clone() };
        let response = self
            .executor
            .execute(HttpRequest::post(post_url).form(fields))
            .await?;

        if self.executor.markers().is_login_failure(&response.body) {
            return Err(HubError::auth("Credentials were rejected"));
        }
        let options = extract::school_options(&response.body);
        if options.len() >= 2 {
            return Ok(CredentialOutcome::SchoolChoice(options));
        }
        Ok(CredentialOutcome::Accepted)
    }

    /// Declines the optional "activate PIN" prompt. Failures only warn.
    async fn decline_pin(&self) {
        if let Err(e) = self.try_decline_pin().await {
            tracing::warn!(
                target: "pupilhub::auth",
                error = %e,
                "Could not decline PIN activation"
            );
        }
    }

    async fn try_decline_pin(&self) -> Result<()> {
        let pin_url = &self.endpoints.pin_page_url;
        let page = self
            .executor
            .execute(HttpRequest::get(pin_url).header("Referer", &self.endpoints.legacy_login_url))
            .await?;
        if !page.body.contains(extract::DECLINE_PIN_EVENT_TARGET) {
            tracing::debug!(target: "pupilhub::auth", "No PIN prompt shown");
            return Ok(());
        }

        let mut fields = vec![
            ("__EVENTTARGET".to_string(), extract::DECLINE_PIN_EVENT_TARGET.to_string()),
            ("__EVENTARGUMENT".to_string(), String::new()),
        ];
        fields.extend(extract::form_state(&page.body));
        self.executor
            .execute(HttpRequest::post(pin_url).header("Referer", pin_url).form(fields))
            .await?;
        Ok(())
    }

    /// Exchanges the token for the callback and follows it back to the hub.
    async fn complete_oauth(&self, token: &str) -> Result<()> {
        let login_url = self.endpoints.oauth_login_url();
        self.executor
            .send(HttpRequest::get(&login_url).header("Referer", &self.endpoints.pin_page_url))
            .await?;

        let legacy = &self.endpoints.legacy_login_url;
        let response = self
            .executor
            .send(
                HttpRequest::post(legacy)
                    .header("Origin", &self.endpoints.hub_base_url)
                    .header("Referer", &login_url)
                    .form([("oauth_token", token)])
                    .no_redirects(),
            )
            .await?;

        let location = response
            .location()
            .ok_or_else(|| {
                HubError::auth(format!("No OAuth callback (HTTP {})", response.status))
            })?;
        let callback = resolve_url(legacy, location)?;

        let landed = self
            .executor
            .execute(HttpRequest::get(&callback).header("Referer", &login_url))
            .await?;
        tracing::debug!(
            target: "pupilhub::auth",
            landed = %landed.url,
            "OAuth completion chain finished"
        );
        Ok(())
    }

    async fn discover_identities(&self) -> (Vec<Identity>, IdentityDiscovery) {
        let request = HttpRequest::get(self.endpoints.landing_url())
            .header("Referer", self.endpoints.oauth_login_url());
        match self.executor.execute(request).await {
            Ok(page) => match extract::discover_identities(&page.body) {
                Discovery::Found { extractor, value } => {
                    tracing::debug!(
                        target: "pupilhub::auth",
                        extractor,
                        count = value.len(),
                        "Identities discovered"
                    );
                    let count = value.len();
                    (value, IdentityDiscovery::Found { count })
                }
                Discovery::NoMatch => {
                    tracing::info!(target: "pupilhub::auth", "Account has no identities");
                    (Vec::new(), IdentityDiscovery::Empty)
                }
            },
            Err(e) => {
                tracing::warn!(target: "pupilhub::auth", error = %e, "Identity discovery failed");
                (Vec::new(), IdentityDiscovery::Failed(e))
            }
        }
    }
}

/// Collapses every failure of the walk into `Auth` or `Connection`.
fn into_login_error(err: HubError) -> HubError {
    match err {
        HubError::Connection { .. } | HubError::Auth(_) => err,
        HubError::TransientHttp { status, message } if status >= 500 => {
            HubError::connection(format!("HTTP {status}: {message}"))
        }
        other => HubError::auth(other.to_string()),
    }
}

fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}...")
}

/// Resolves a `Location` header or script target against the request URL.
fn resolve_url(base: &str, location: &str) -> Result<String> {
    let joined = Url::parse(base).and_then(|base| base.join(location.trim()));
    match joined {
        Ok(url) => Ok(url.into()),
        Err(e) => Err(HubError::parse("redirect target", format!("{location}: {e}"))),
    }
}
