//! Scoped session handle tying the components together.

use crate::auth::{Credentials, LoginOutcome, SessionAuthenticator};
use crate::backoff::AuthBackoff;
use crate::cache::DebouncedCache;
use crate::executor::{RequestExecutor, VerbFallbackPlan};
use crate::schedule_cache::ScheduleCache;
use crate::switcher::IdentitySwitcher;
use pupilhub_core::schedule::{DateRange, EntryKind, ScheduleEntry, parse_entries};
use pupilhub_core::school::domain_hint_from_username;
use pupilhub_core::{
    Completeness, HttpTransport, HubConfig, HubError, Identity, KeyValueStore, Result,
    ScheduleRecord, SchoolHints, evaluate,
};
use pupilhub_infrastructure::{ConfigStorage, HubPaths, JsonFileStore, ReqwestTransport};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One logged-in account.
///
/// Operations are serialized: a switch and the fetch that depends on it never
/// interleave with another operation on the same cookie jar. Dropping the
/// handle ends the session; call [`HubClient::close`] first to flush the
/// cache.
pub struct HubClient {
    config: HubConfig,
    executor: Arc<RequestExecutor>,
    authenticator: SessionAuthenticator,
    switcher: IdentitySwitcher,
    schedules: ScheduleCache,
    credentials: Credentials,
    backoff: Mutex<AuthBackoff>,
    op_lock: Mutex<()>,
}

impl HubClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn KeyValueStore>,
        config: HubConfig,
        credentials: Credentials,
    ) -> Self {
        let executor = Arc::new(RequestExecutor::new(
            transport,
            config.timing.clone(),
            config.markers.clone(),
        ));
        let authenticator = SessionAuthenticator::new(executor.clone(), config.endpoints.clone());
        let switcher = IdentitySwitcher::new(
            executor.clone(),
            config.endpoints.clone(),
            authenticator.state(),
        );
        let schedules = ScheduleCache::new(
            DebouncedCache::new(store, config.cache.clone()),
            config.cache.retention_days,
        );

        Self {
            config,
            executor,
            authenticator,
            switcher,
            schedules,
            credentials,
            backoff: Mutex::new(AuthBackoff::default()),
            op_lock: Mutex::new(()),
        }
    }

    /// Builds a client over the default config file, the platform storage
    /// directory and a cookie-jar reqwest transport.
    pub fn with_default_paths(credentials: Credentials) -> Result<Self> {
        let config = ConfigStorage::new(HubPaths::config_file()?).load()?;
        let transport = Arc::new(ReqwestTransport::new(&config.timing)?);
        let store = Arc::new(JsonFileStore::with_default_path()?);
        Ok(Self::new(transport, store, config, credentials))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn schedules(&self) -> &ScheduleCache {
        &self.schedules
    }

    pub async fn is_authenticated(&self) -> bool {
        self.authenticator.is_authenticated().await
    }

    /// Logs in and persists what the walk learned.
    ///
    /// After rejected credentials further walks are refused with
    /// [`HubError::Backoff`] for 5, 15, 45 minutes, then 2 hours per
    /// consecutive failure.
    pub async fn login(&self) -> Result<LoginOutcome> {
        let _op = self.op_lock.lock().await;
        self.login_locked().await
    }

    async fn login_locked(&self) -> Result<LoginOutcome> {
        if let Err(e) = self.backoff.lock().await.check() {
            tracing::warn!(target: "pupilhub::auth", error = %e, "Login skipped");
            return Err(e);
        }

        let stored = self.schedules.selected_school().await;
        let hints = SchoolHints {
            stored_url: stored.as_ref().map(|school| school.login_url.clone()),
            stored_label: stored.map(|school| school.label),
            domain_hint: domain_hint_from_username(self.credentials.username()),
        };

        let outcome = match self.authenticator.login(&self.credentials, &hints).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_auth() {
                    self.backoff.lock().await.record_failure();
                }
                return Err(e);
            }
        };
        self.backoff.lock().await.reset();

        if let Some(school) = &outcome.school {
            self.schedules.set_selected_school(school).await;
        }
        self.schedules.record_auth_success().await;
        let identities = self.identities().await;
        if !identities.is_empty() {
            self.schedules.set_identities(&identities).await;
        }
        Ok(outcome)
    }

    async fn ensure_logged_in(&self) -> Result<()> {
        if !self.authenticator.is_authenticated().await {
            self.login_locked().await?;
        }
        Ok(())
    }

    /// Identities known to the session, in discovery order.
    pub async fn identities(&self) -> Vec<Identity> {
        let state = self.authenticator.state();
        let state = state.lock().await;
        state.registry.iter().cloned().collect()
    }

    /// Activates an identity, re-logging in once if the session was rejected.
    pub async fn switch_to(&self, identity_id: &str) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        self.ensure_logged_in().await?;

        match self.switcher.switch_to(identity_id).await {
            Err(e) if e.needs_relogin() => {
                tracing::info!(error = %e, "Session rejected during switch, logging in again");
                self.login_locked().await?;
                self.switcher.switch_to(identity_id).await.map_err(relogin_exhausted)
            }
            other => other,
        }
    }

    /// Fetches one identity's schedule for `range`, sorted by date.
    pub async fn fetch_schedule(
        &self,
        identity_id: &str,
        range: DateRange,
    ) -> Result<Vec<ScheduleEntry>> {
        let _op = self.op_lock.lock().await;
        self.ensure_logged_in().await?;
        self.fetch_with_relogin(identity_id, range).await
    }

    async fn fetch_with_relogin(
        &self,
        identity_id: &str,
        range: DateRange,
    ) -> Result<Vec<ScheduleEntry>> {
        match self.fetch_once(identity_id, range).await {
            Err(e) if e.needs_relogin() => {
                tracing::info!(
                    identity = identity_id,
                    error = %e,
                    "Session rejected during fetch, logging in again"
                );
                self.login_locked().await?;
                self.fetch_once(identity_id, range).await.map_err(relogin_exhausted)
            }
            other => other,
        }
    }

    async fn fetch_once(&self, identity_id: &str, range: DateRange) -> Result<Vec<ScheduleEntry>> {
        if !self.switcher.switch_to(identity_id).await? {
            tracing::warn!(identity = identity_id, "Switch not confirmed, fetching anyway");
        }

        let mut entries = self.fetch_timetable(range).await?;
        entries.extend(self.fetch_time_registration(range).await?);
        entries.sort_by_key(|entry| entry.date);
        tracing::debug!(identity = identity_id, count = entries.len(), "Fetched schedule");
        Ok(entries)
    }

    async fn fetch_timetable(&self, range: DateRange) -> Result<Vec<ScheduleEntry>> {
        let endpoints = &self.config.endpoints;
        let url = endpoints.hub_url(&endpoints.timetable_path);
        let plan = VerbFallbackPlan::get_then_post(url, range.params());
        self.fetch_entries(EntryKind::Timetable, &plan).await
    }

    /// Time registrations, falling back to the calendar endpoint when the
    /// primary one is empty or failing.
    async fn fetch_time_registration(&self, range: DateRange) -> Result<Vec<ScheduleEntry>> {
        let endpoints = &self.config.endpoints;
        let primary = VerbFallbackPlan::get_then_post(
            endpoints.hub_url(&endpoints.time_registration_path),
            range.params(),
        );
        match self.fetch_entries(EntryKind::TimeRegistration, &primary).await {
            Ok(entries) if !entries.is_empty() => return Ok(entries),
            Ok(_) => {}
            Err(e @ HubError::TransientHttp { .. }) => {
                tracing::warn!(
                    error = %e,
                    "Time registration endpoint failed, trying calendar data"
                );
            }
            Err(e) => return Err(e),
        }

        self.executor.retry_pause().await;
        let calendar = VerbFallbackPlan::get_then_post(
            endpoints.hub_url(&endpoints.time_registration_calendar_path),
            range.params(),
        );
        self.fetch_entries(EntryKind::TimeRegistration, &calendar).await
    }

    /// Runs a plan and parses its entries. Malformed payloads degrade to an
    /// empty list.
    async fn fetch_entries(
        &self,
        kind: EntryKind,
        plan: &VerbFallbackPlan,
    ) -> Result<Vec<ScheduleEntry>> {
        let payload: JsonValue = match self.executor.execute_json(plan).await {
            Ok(payload) => payload,
            Err(e) if e.is_parse() => {
                tracing::warn!(url = plan.url(), error = %e, "Unreadable schedule payload");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        match parse_entries(kind, &payload) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(url = plan.url(), error = %e, "Unexpected schedule payload shape");
                Ok(Vec::new())
            }
        }
    }

    /// Refreshes every known identity and reports completeness.
    ///
    /// A failed identity keeps its previous data marked as cached, or is
    /// recorded as missing. Once re-login has been exhausted the remaining
    /// identities are marked failed without further requests. When this
    /// session discovered no identities, the stored ones are reported as
    /// failed rather than skipped.
    pub async fn refresh_schedules(&self, range: DateRange) -> Result<Completeness> {
        let _op = self.op_lock.lock().await;

        if let Err(e) = self.ensure_logged_in().await {
            for identity in self.schedules.identities().await {
                self.schedules.mark_refresh_failed(&identity.id).await;
            }
            return Err(e);
        }

        let (ids, live) = self.tracked_ids().await;
        if !live && !ids.is_empty() {
            tracing::warn!(
                known = ids.len(),
                "No identities discovered this session, keeping stored ones as failed"
            );
        }

        let mut auth_lost = false;
        for id in &ids {
            if auth_lost || !live {
                self.schedules.mark_refresh_failed(id).await;
                continue;
            }
            match self.fetch_with_relogin(id, range).await {
                Ok(entries) => {
                    let record = ScheduleRecord::fresh(id.as_str(), entries);
                    self.schedules.record_fresh(record).await;
                }
                Err(e) => {
                    let status = self.schedules.mark_refresh_failed(id).await;
                    tracing::warn!(
                        identity = %id,
                        status = status.as_str(),
                        error = %e,
                        "Schedule refresh failed"
                    );
                    auth_lost = e.is_auth() || e.is_backoff();
                }
            }
        }

        let report = evaluate(&ids, &self.schedules.stored_records().await);
        tracing::info!(
            complete = report.complete,
            missing = report.missing.len(),
            stale = report.stale.len(),
            "Schedule refresh finished"
        );
        Ok(report)
    }

    /// Completeness of the cached data, without touching the network.
    pub async fn completeness(&self) -> Completeness {
        let (ids, _) = self.tracked_ids().await;
        evaluate(&ids, &self.schedules.stored_records().await)
    }

    /// Ids from the live registry, or the stored ones when this session has
    /// none. The flag tells which source was used.
    async fn tracked_ids(&self) -> (Vec<String>, bool) {
        let live: Vec<String> = self.identities().await.into_iter().map(|i| i.id).collect();
        if !live.is_empty() {
            return (live, true);
        }
        let stored = self.schedules.identities().await;
        (stored.into_iter().map(|i| i.id).collect(), false)
    }

    /// Flushes pending cache writes and ends the session.
    pub async fn close(self) {
        self.schedules.flush().await;
        tracing::debug!("Client closed");
    }
}

fn relogin_exhausted(err: HubError) -> HubError {
    if err.needs_relogin() {
        HubError::auth(format!("Session rejected again after re-login: {err}"))
    } else {
        err
    }
}
