//! The login/logout handshake with the IdP.
//!
//! ```text
//! Idle -> RequestSent -> ResponseReceived -> Bound -> SessionEstablished
//!   \________________________\__________________\______> Failed(kind)
//! ```

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::{
    account::{AccountId, AccountStore},
    authn_request::ProtocolBinding,
    binder::AccountBinder,
    redirect_guard::{RedirectGuard, SafeRedirect},
    session::{MemorySessionManager, SessionId, SessionManager, SessionRecord},
    settings::SharedRegistry,
    state::{
        new_browser_nonce, AssertionReplayCache, AuthnRequestContext, MemoryStateStore,
        RequestKind, RequestStateStore,
    },
    toolkit::SamlToolkit,
    utils::{Clock, SystemClock},
    HandshakeError, UnsafeRedirect,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    RequestSent,
    ResponseReceived,
    Bound,
    SessionEstablished,
    Failed(&'static str),
}

impl HandshakeState {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::RequestSent => "request_sent",
            HandshakeState::ResponseReceived => "response_received",
            HandshakeState::Bound => "bound",
            HandshakeState::SessionEstablished => "session_established",
            HandshakeState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandshakeState::SessionEstablished | HandshakeState::Failed(_)
        )
    }

    pub fn advance(self, next: HandshakeState) -> Result<HandshakeState, HandshakeError> {
        use HandshakeState::*;

        let legal = match (self, next) {
            (Idle, RequestSent)
            | (RequestSent, ResponseReceived)
            | (ResponseReceived, Bound)
            | (Bound, SessionEstablished) => true,
            (from, Failed(_)) => !from.is_terminal(),
            _ => false,
        };
        if !legal {
            return Err(HandshakeError::IllegalTransition {
                from: self.name(),
                to: next.name(),
            });
        }
        Ok(next)
    }
}

struct Handshake<'a> {
    idp_key: &'a str,
    state: HandshakeState,
}

impl<'a> Handshake<'a> {
    fn new(idp_key: &'a str, state: HandshakeState) -> Self {
        Self { idp_key, state }
    }

    fn advance(&mut self, next: HandshakeState) -> Result<(), HandshakeError> {
        self.state = self.state.advance(next)?;
        debug!(idp = self.idp_key, state = self.state.name(), "handshake transition");
        Ok(())
    }

    /// Logs the failure with its reason and moves to `Failed`.
    fn fail(&mut self, err: HandshakeError) -> HandshakeError {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Failed(err.kind());
        }
        if err.is_server_fault() {
            error!(idp = self.idp_key, reason = err.kind(), error = %err, "handshake failed");
        } else {
            warn!(idp = self.idp_key, reason = err.kind(), error = %err, "handshake failed");
        }
        err
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRedirect {
    pub url: String,
    pub request_id: String,
    /// Must come back with the ACS callback, usually as a short-lived cookie.
    pub browser_nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedOutcome {
    pub session: SessionRecord,
    pub replaced_session: Option<SessionId>,
    pub account_id: AccountId,
    pub is_new_account: bool,
    pub redirect_to: SafeRedirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// Continue single logout at the IdP.
    IdpRedirect { url: String, request_id: String },
    /// Local logout only.
    Local { redirect_to: SafeRedirect },
}

pub struct Orchestrator {
    registry: Arc<SharedRegistry>,
    toolkit: Arc<dyn SamlToolkit>,
    accounts: Arc<dyn AccountStore>,
    requests: Arc<dyn RequestStateStore>,
    sessions: Arc<dyn SessionManager>,
    replay_cache: AssertionReplayCache,
    clock: Arc<dyn Clock>,
}

/// Re-checks a stored target; anything that no longer passes becomes `/`.
fn reguard(guard: &RedirectGuard, target: &SafeRedirect, host: &str, idp: &str) -> SafeRedirect {
    guard
        .sanitize(target.as_str(), host)
        .unwrap_or_else(|err| {
            warn!(idp, reason = err.reason, "stored return target rejected");
            SafeRedirect::root()
        })
}

fn guard_target(
    guard: &RedirectGuard,
    return_to: Option<&str>,
    host: &str,
) -> Result<SafeRedirect, UnsafeRedirect> {
    match return_to.map(str::trim) {
        None | Some("") => Ok(SafeRedirect::root()),
        Some(target) => guard.sanitize(target, host),
    }
}

impl Orchestrator {
    /// In-memory request state and sessions, and the system clock.
    pub fn new(
        registry: Arc<SharedRegistry>,
        toolkit: Arc<dyn SamlToolkit>,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            registry,
            toolkit,
            accounts,
            requests: Arc::new(MemoryStateStore::new()),
            sessions: Arc::new(MemorySessionManager::new()),
            replay_cache: AssertionReplayCache::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_request_store(self, requests: Arc<dyn RequestStateStore>) -> Self {
        Self { requests, ..self }
    }

    pub fn with_sessions(self, sessions: Arc<dyn SessionManager>) -> Self {
        Self { sessions, ..self }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self { clock, ..self }
    }

    pub fn sessions(&self) -> &dyn SessionManager {
        self.sessions.as_ref()
    }

    /// Drops expired request contexts and replay-cache entries.
    pub fn purge_expired(&self) -> Result<usize, HandshakeError> {
        let now = self.clock.now();
        let purged = self.requests.purge_expired(now)? + self.replay_cache.purge_expired(now);
        debug!(purged, "purged expired handshake state");
        Ok(purged)
    }

    /// `current_session` is the browser's session, if it has one. Only that
    /// session can later have the IdP identity linked to its account.
    pub fn login(
        &self,
        idp_key: &str,
        return_to: Option<&str>,
        request_host: &str,
        current_session: Option<&SessionId>,
    ) -> Result<LoginRedirect, HandshakeError> {
        let mut handshake = Handshake::new(idp_key, HandshakeState::Idle);
        self.start_login(&mut handshake, return_to, request_host, current_session)
            .map_err(|err| handshake.fail(err))
    }

    fn start_login(
        &self,
        handshake: &mut Handshake,
        return_to: Option<&str>,
        request_host: &str,
        current_session: Option<&SessionId>,
    ) -> Result<LoginRedirect, HandshakeError> {
        let registry = self.registry.snapshot();
        let target = guard_target(registry.redirect_guard(), return_to, request_host)?;
        let settings = registry.resolve(handshake.idp_key)?;
        let now = self.clock.now();

        let requested_context = settings.security.requested_authn_context.as_ref();
        let redirect = self
            .toolkit
            .build_authn_request(&settings, requested_context, now)?;
        let browser_nonce = new_browser_nonce();
        self.requests.save(
            AuthnRequestContext::new(
                redirect.request_id.as_str(),
                handshake.idp_key,
                RequestKind::Login,
                target,
                now,
                settings.state_expiry,
            )
            .bound_to_browser(&browser_nonce, current_session.copied()),
        )?;
        handshake.advance(HandshakeState::RequestSent)?;

        Ok(LoginRedirect {
            url: redirect.url,
            request_id: redirect.request_id,
            browser_nonce,
        })
    }

    /// ACS callback: the IdP posted `saml_response` with `relay_state`, and
    /// the browser presented `browser_nonce` from its login.
    pub fn authorized(
        &self,
        idp_key: &str,
        saml_response: &str,
        relay_state: Option<&str>,
        browser_nonce: Option<&str>,
        request_host: &str,
        current_session: Option<&SessionId>,
    ) -> Result<AuthorizedOutcome, HandshakeError> {
        let mut handshake = Handshake::new(idp_key, HandshakeState::RequestSent);
        self.finish_login(
            &mut handshake,
            saml_response,
            relay_state,
            browser_nonce,
            request_host,
            current_session,
        )
        .map_err(|err| handshake.fail(err))
    }

    fn consume_context(
        &self,
        idp_key: &str,
        kind: RequestKind,
        relay_state: Option<&str>,
        browser_nonce: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<AuthnRequestContext, HandshakeError> {
        let request_id = relay_state
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(HandshakeError::UnknownOrExpiredRequest)?;
        self.requests
            .consume(request_id, now)?
            .filter(|context| {
                context.idp_key == idp_key
                    && context.kind == kind
                    && context.accepts_browser(browser_nonce)
            })
            .ok_or(HandshakeError::UnknownOrExpiredRequest)
    }

    fn finish_login(
        &self,
        handshake: &mut Handshake,
        saml_response: &str,
        relay_state: Option<&str>,
        browser_nonce: Option<&str>,
        request_host: &str,
        current_session: Option<&SessionId>,
    ) -> Result<AuthorizedOutcome, HandshakeError> {
        let idp_key = handshake.idp_key;
        let registry = self.registry.snapshot();
        let settings = registry.resolve(idp_key)?;
        let now = self.clock.now();

        let context =
            self.consume_context(idp_key, RequestKind::Login, relay_state, browser_nonce, now)?;
        handshake.advance(HandshakeState::ResponseReceived)?;

        let assertion =
            self.toolkit
                .validate_response(&settings, saml_response, &context.request_id, now)?;
        let remember_until = assertion.replay_horizon(now, settings.state_expiry)
            + settings.security.allowed_clock_skew;
        self.replay_cache
            .check_and_record(&assertion.id, remember_until, now)?;

        // A session is only a linking target if it started this login itself;
        // any other session is replaced below.
        let current = match current_session {
            Some(id) if context.started_by() == Some(id) => self.sessions.get(id)?,
            Some(_) => {
                debug!(idp = idp_key, "session did not start this login, not linking");
                None
            }
            None => None,
        };
        let bound = AccountBinder::new(self.accounts.as_ref()).bind(
            idp_key,
            &assertion,
            &settings.attribute_mapping,
            &settings.account_policy,
            current.as_ref().map(|session| &session.account_id),
            now,
        )?;
        handshake.advance(HandshakeState::Bound)?;

        let replaced_session = match current_session {
            Some(id) => self.sessions.terminate(id)?.map(|old| old.id),
            None => None,
        };
        let session = SessionRecord::new(
            bound.account_id.clone(),
            idp_key,
            assertion.name_id.clone(),
            assertion.session_index.clone(),
            now,
        );
        self.sessions.establish(session.clone())?;
        handshake.advance(HandshakeState::SessionEstablished)?;
        info!(
            idp = idp_key,
            account = %bound.account_id,
            new_account = bound.is_new_account,
            "session established"
        );

        Ok(AuthorizedOutcome {
            session,
            replaced_session,
            account_id: bound.account_id,
            is_new_account: bound.is_new_account,
            redirect_to: reguard(
                registry.redirect_guard(),
                &context.return_to,
                request_host,
                idp_key,
            ),
        })
    }

    pub fn metadata(&self, idp_key: &str) -> Result<Vec<u8>, HandshakeError> {
        let registry = self.registry.snapshot();
        let result = registry
            .resolve(idp_key)
            .map_err(HandshakeError::from)
            .and_then(|settings| {
                self.toolkit
                    .metadata_xml(&settings, self.clock.now())
                    .map_err(HandshakeError::from)
            });
        result.map_err(|err| Handshake::new(idp_key, HandshakeState::Idle).fail(err))
    }

    /// SP-initiated logout. The local session ends whatever else happens.
    pub fn logout(
        &self,
        idp_key: &str,
        session_id: Option<&SessionId>,
        return_to: Option<&str>,
        request_host: &str,
    ) -> Result<LogoutOutcome, HandshakeError> {
        let terminated = match session_id {
            Some(id) => self.sessions.terminate(id)?,
            None => None,
        };

        let registry = self.registry.snapshot();
        let target = guard_target(registry.redirect_guard(), return_to, request_host)
            .unwrap_or_else(|err| {
                warn!(idp = idp_key, reason = err.reason, "logout target rejected");
                SafeRedirect::root()
            });
        let settings = registry
            .resolve(idp_key)
            .map_err(|err| Handshake::new(idp_key, HandshakeState::Idle).fail(err.into()))?;

        let record = terminated.filter(|record| record.idp_key == idp_key);
        let (Some(record), Some(_)) = (record, settings.idp.slo_url.as_deref()) else {
            debug!(idp = idp_key, "local logout");
            return Ok(LogoutOutcome::Local {
                redirect_to: target,
            });
        };

        let now = self.clock.now();
        let start = || -> Result<LogoutOutcome, HandshakeError> {
            let redirect = self.toolkit.build_logout_request(
                &settings,
                &record.name_id,
                record.session_index.as_deref(),
                now,
            )?;
            self.requests.save(AuthnRequestContext::new(
                redirect.request_id.as_str(),
                idp_key,
                RequestKind::Logout,
                target.clone(),
                now,
                settings.state_expiry,
            ))?;
            Ok(LogoutOutcome::IdpRedirect {
                url: redirect.url,
                request_id: redirect.request_id,
            })
        };
        start().map_err(|err| Handshake::new(idp_key, HandshakeState::Idle).fail(err))
    }

    /// SLS callback carrying the IdP's LogoutResponse. The IdP's verdict is
    /// logged; the local session is gone either way.
    pub fn logout_callback(
        &self,
        idp_key: &str,
        saml_response: &str,
        relay_state: Option<&str>,
        binding: ProtocolBinding,
        current_session: Option<&SessionId>,
        request_host: &str,
    ) -> Result<SafeRedirect, HandshakeError> {
        let fail = |err: HandshakeError| Handshake::new(idp_key, HandshakeState::RequestSent).fail(err);

        if let Some(id) = current_session {
            self.sessions.terminate(id).map_err(|err| fail(err.into()))?;
        }
        let registry = self.registry.snapshot();
        let settings = registry.resolve(idp_key).map_err(|err| fail(err.into()))?;
        let now = self.clock.now();
        let context = self
            .consume_context(idp_key, RequestKind::Logout, relay_state, None, now)
            .map_err(fail)?;

        match self.toolkit.validate_logout_response(
            &settings,
            saml_response,
            binding,
            &context.request_id,
            now,
        ) {
            Ok(status) if status.is_success() => {
                info!(idp = idp_key, "single logout completed");
            }
            Ok(status) => {
                warn!(idp = idp_key, status = %status.status_code, "IdP reported logout failure");
            }
            Err(err) => {
                warn!(idp = idp_key, reason = %err, "invalid logout response");
            }
        }

        Ok(reguard(
            registry.redirect_guard(),
            &context.return_to,
            request_host,
            idp_key,
        ))
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;
    use url::Url;

    use crate::{
        account::{MemoryAccountStore, NewAccount},
        attributes::Attributes,
        settings::SettingsRegistry,
        testing::{sample_registry, sample_settings, FakeResponse, ManualClock, MemoryToolkit, CN},
        BindingFailure, ValidationFailure, STATUS_SUCCESS,
    };

    use super::*;

    const HOST: &str = "app.example";

    struct Fixture {
        orchestrator: Orchestrator,
        toolkit: Arc<MemoryToolkit>,
        accounts: Arc<MemoryAccountStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(registry: SettingsRegistry) -> Fixture {
        let toolkit = Arc::new(MemoryToolkit::new());
        let accounts = Arc::new(MemoryAccountStore::new());
        let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
        let orchestrator = Orchestrator::new(
            Arc::new(SharedRegistry::new(registry)),
            toolkit.clone(),
            accounts.clone(),
        )
        .with_clock(clock.clone());
        Fixture {
            orchestrator,
            toolkit,
            accounts,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(sample_registry())
    }

    impl Fixture {
        fn respond(&self, request_id: &str, name_id: &str) -> String {
            self.toolkit.issue(FakeResponse::for_request(
                &sample_settings(),
                request_id,
                name_id,
                self.clock.now(),
            ))
        }
    }

    #[test]
    fn can_log_in_end_to_end() {
        let f = fixture();
        let login = f
            .orchestrator
            .login("idp1", Some("/dashboard"), HOST, None)
            .unwrap();
        let url = Url::parse(&login.url).unwrap();
        assert_eq!(url.host_str(), Some("idp.example"));

        let response = f.respond(&login.request_id, "user@example.org");
        let outcome = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap();

        assert_eq!(outcome.redirect_to.as_str(), "/dashboard");
        assert!(outcome.is_new_account);
        assert_eq!(f.accounts.links_for(&outcome.account_id).unwrap().len(), 1);
        let session = f
            .orchestrator
            .sessions()
            .get(&outcome.session.id)
            .unwrap()
            .unwrap();
        assert_eq!(session.name_id.value, "user@example.org");
    }

    #[test]
    fn unsafe_return_target_is_refused_at_login() {
        let f = fixture();
        for target in ["https://evil.example/x", "//evil.example/x"] {
            let err = f
                .orchestrator
                .login("idp1", Some(target), HOST, None)
                .unwrap_err();
            assert!(matches!(err, HandshakeError::UnsafeRedirect(_)));
        }
        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let response = f.respond(&login.request_id, "user@example.org");
        let outcome = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap();
        assert_eq!(outcome.redirect_to.as_str(), "/");
    }

    #[test]
    fn unknown_idp_is_not_found() {
        let err = fixture().orchestrator.login("nope", None, HOST, None).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn request_id_is_consumed_once() {
        let f = fixture();
        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let response = f.respond(&login.request_id, "user@example.org");
        f.orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap();

        let replay = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap_err();
        assert!(matches!(replay, HandshakeError::UnknownOrExpiredRequest));
        assert_eq!(f.toolkit.validation_calls(), 1);
    }

    #[test]
    fn expired_request_state_is_rejected_without_validation() {
        let f = fixture();
        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let response = f.respond(&login.request_id, "user@example.org");
        f.clock.advance(Duration::seconds(301));

        let err = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnknownOrExpiredRequest));
        assert_eq!(err.public_message(), crate::GENERIC_FAILURE);
        assert_eq!(f.toolkit.validation_calls(), 0);
    }

    #[test]
    fn request_for_another_idp_is_rejected() {
        let mut other = sample_settings();
        other.idp_key = "idp2".into();
        let f = fixture_with(SettingsRegistry::from_resolved(
            [sample_settings(), other],
            RedirectGuard::default(),
        ));
        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let response = f.respond(&login.request_id, "user@example.org");

        let err = f
            .orchestrator
            .authorized(
                "idp2",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnknownOrExpiredRequest));
    }

    #[test]
    fn expired_assertion_fails_even_when_signed() {
        let f = fixture();
        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let now = f.clock.now();
        let response = f.toolkit.issue(
            FakeResponse::for_request(&sample_settings(), &login.request_id, "u@example.org", now)
                .expired_at(now - Duration::minutes(10)),
        );

        let err = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Validation(ValidationFailure::Expired)
        ));
        assert_eq!(f.accounts.account_count().unwrap(), 0);
    }

    #[test]
    fn replayed_assertion_is_rejected() {
        let f = fixture();
        let first = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let second = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let now = f.clock.now();
        for (login, should_pass) in [(first, true), (second, false)] {
            let token = f.toolkit.issue(
                FakeResponse::for_request(&sample_settings(), &login.request_id, "u@x.org", now)
                    .with_assertion_id("_same"),
            );
            let result = f.orchestrator.authorized(
                "idp1",
                &token,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            );
            if should_pass {
                result.unwrap();
            } else {
                assert!(matches!(
                    result,
                    Err(HandshakeError::Validation(ValidationFailure::Replayed))
                ));
            }
        }
    }

    #[test]
    fn missing_attributes_fail_binding() {
        let f = fixture();
        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let now = f.clock.now();
        let response = f.toolkit.issue(
            FakeResponse::for_request(&sample_settings(), &login.request_id, "u@x.org", now)
                .with_attributes(Attributes::new().with(CN, ["Jane Doe"])),
        );
        let err = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Binding(BindingFailure::MissingAttributes(_))
        ));
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn existing_session_is_replaced_and_linked() {
        let f = fixture();
        let account = f.accounts.insert_account(NewAccount::default()).unwrap();
        let old = SessionRecord::new(
            account.clone(),
            "local",
            crate::assertion::NameId::new("local-user"),
            None,
            f.clock.now(),
        );
        let old_id = old.id;
        f.orchestrator.sessions().establish(old).unwrap();

        let login = f
            .orchestrator
            .login("idp1", None, HOST, Some(&old_id))
            .unwrap();
        let response = f.respond(&login.request_id, "user@example.org");
        let outcome = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                Some(&old_id),
            )
            .unwrap();

        assert_eq!(outcome.account_id, account);
        assert_eq!(outcome.replaced_session, Some(old_id));
        assert!(f.orchestrator.sessions().get(&old_id).unwrap().is_none());
    }

    #[test]
    fn response_delivered_to_another_browser_is_refused() {
        let f = fixture();
        let victim_account = f.accounts.insert_account(NewAccount::default()).unwrap();
        let victim = SessionRecord::new(
            victim_account.clone(),
            "local",
            crate::assertion::NameId::new("victim"),
            None,
            f.clock.now(),
        );
        let victim_id = victim.id;
        f.orchestrator.sessions().establish(victim).unwrap();

        let attacker = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let response = f.respond(&attacker.request_id, "attacker@example.org");
        for nonce in [None, Some("guessed")] {
            let err = f
                .orchestrator
                .authorized(
                    "idp1",
                    &response,
                    Some(&attacker.request_id),
                    nonce,
                    HOST,
                    Some(&victim_id),
                )
                .unwrap_err();
            assert!(matches!(err, HandshakeError::UnknownOrExpiredRequest));
        }
        assert_eq!(f.toolkit.validation_calls(), 0);
        assert!(f.accounts.links_for(&victim_account).unwrap().is_empty());
    }

    #[test]
    fn session_that_did_not_start_the_login_is_replaced_not_linked() {
        let f = fixture();
        let other_account = f.accounts.insert_account(NewAccount::default()).unwrap();
        let other = SessionRecord::new(
            other_account.clone(),
            "local",
            crate::assertion::NameId::new("other"),
            None,
            f.clock.now(),
        );
        let other_id = other.id;
        f.orchestrator.sessions().establish(other).unwrap();

        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let response = f.respond(&login.request_id, "user@example.org");
        let outcome = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                Some(&other_id),
            )
            .unwrap();

        assert_ne!(outcome.account_id, other_account);
        assert!(outcome.is_new_account);
        assert_eq!(outcome.replaced_session, Some(other_id));
        assert!(f.accounts.links_for(&other_account).unwrap().is_empty());
    }

    #[test]
    fn concurrent_duplicate_submissions_have_one_winner() {
        let f = fixture();
        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let response = f.respond(&login.request_id, "user@example.org");

        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        f.orchestrator
                            .authorized(
                                "idp1",
                                &response,
                                Some(&login.request_id),
                                Some(&login.browser_nonce),
                                HOST,
                                None,
                            )
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });
        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(f.accounts.account_count().unwrap(), 1);
    }

    #[test]
    fn can_run_single_logout() {
        let f = fixture();
        let login = f.orchestrator.login("idp1", None, HOST, None).unwrap();
        let response = f.respond(&login.request_id, "user@example.org");
        let outcome = f
            .orchestrator
            .authorized(
                "idp1",
                &response,
                Some(&login.request_id),
                Some(&login.browser_nonce),
                HOST,
                None,
            )
            .unwrap();

        let logout = f
            .orchestrator
            .logout("idp1", Some(&outcome.session.id), Some("/bye"), HOST)
            .unwrap();
        let LogoutOutcome::IdpRedirect { url, request_id } = logout else {
            panic!("expected a redirect to the IdP");
        };
        assert!(url.starts_with("https://idp.example/idp/profile/SAML2/Redirect/SLO?"));
        assert!(f
            .orchestrator
            .sessions()
            .get(&outcome.session.id)
            .unwrap()
            .is_none());

        let token = f
            .toolkit
            .issue_logout(&sample_settings(), &request_id, STATUS_SUCCESS);
        let target = f
            .orchestrator
            .logout_callback(
                "idp1",
                &token,
                Some(&request_id),
                ProtocolBinding::Redirect,
                None,
                HOST,
            )
            .unwrap();
        assert_eq!(target.as_str(), "/bye");
    }

    #[test]
    fn logout_without_session_is_local() {
        let f = fixture();
        let outcome = f
            .orchestrator
            .logout("idp1", None, Some("https://evil.example"), HOST)
            .unwrap();
        assert_eq!(
            outcome,
            LogoutOutcome::Local {
                redirect_to: SafeRedirect::root()
            }
        );
    }

    #[test]
    fn can_render_metadata() {
        let xml = fixture().orchestrator.metadata("idp1").unwrap();
        let xml = String::from_utf8(xml).unwrap();
        assert!(xml.contains("https://app.example/saml/acs/idp1"));
    }

    #[test]
    fn illegal_transitions_are_refused() {
        assert!(HandshakeState::Idle
            .advance(HandshakeState::Bound)
            .is_err());
        assert!(HandshakeState::SessionEstablished
            .advance(HandshakeState::Failed("validation"))
            .is_err());
        assert_eq!(
            HandshakeState::RequestSent
                .advance(HandshakeState::Failed("validation"))
                .unwrap(),
            HandshakeState::Failed("validation")
        );
    }
}
