//! Framework-neutral HTTP surface. A web framework turns its request into an
//! [`HttpRequest`], calls [`Endpoints::handle`] and applies the returned
//! response and [`SessionChange`]. A login also hands out a browser nonce the
//! framework keeps in a short-lived cookie and passes back on the ACS request.

use std::collections::HashMap;

use tracing::{debug, warn};
use url::form_urlencoded;

use crate::{
    authn_request::ProtocolBinding,
    orchestrator::{LogoutOutcome, Orchestrator},
    session::SessionId,
    HandshakeError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl From<&str> for Method {
    fn from(value: &str) -> Self {
        if value.eq_ignore_ascii_case("GET") {
            Method::Get
        } else if value.eq_ignore_ascii_case("POST") {
            Method::Post
        } else {
            Method::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub host: String,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    /// Raw `application/x-www-form-urlencoded` body.
    pub body: Vec<u8>,
    /// Session cookie, already decoded by the framework.
    pub session: Option<SessionId>,
    /// Login cookie set from [`EndpointResponse::login_nonce`].
    pub login_nonce: Option<String>,
}

impl HttpRequest {
    pub fn get(host: &str, path_and_query: &str) -> Self {
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));
        Self {
            method: Method::Get,
            host: host.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            body: Vec::new(),
            session: None,
            login_nonce: None,
        }
    }

    pub fn post_form<'a, I>(host: &str, path: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        Self {
            method: Method::Post,
            host: host.to_string(),
            path: path.to_string(),
            query: String::new(),
            body: body.into_bytes(),
            session: None,
            login_nonce: None,
        }
    }

    pub fn with_session(self, session: Option<SessionId>) -> Self {
        Self { session, ..self }
    }

    pub fn with_login_nonce(self, login_nonce: Option<String>) -> Self {
        Self {
            login_nonce,
            ..self
        }
    }

    fn query_params(&self) -> HashMap<String, String> {
        form_urlencoded::parse(self.query.as_bytes())
            .into_owned()
            .collect()
    }

    fn form_params(&self) -> HashMap<String, String> {
        form_urlencoded::parse(&self.body).into_owned().collect()
    }

    /// Query parameters for GET, form fields for POST.
    fn params(&self) -> HashMap<String, String> {
        match self.method {
            Method::Post => self.form_params(),
            _ => self.query_params(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpResponse {
    Redirect { location: String },
    Xml { body: Vec<u8> },
    Error { status: u16, message: &'static str },
}

impl HttpResponse {
    pub fn status(&self) -> u16 {
        match self {
            HttpResponse::Redirect { .. } => 302,
            HttpResponse::Xml { .. } => 200,
            HttpResponse::Error { status, .. } => *status,
        }
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            HttpResponse::Xml { .. } => Some("text/xml"),
            HttpResponse::Error { .. } => Some("text/plain"),
            HttpResponse::Redirect { .. } => None,
        }
    }
}

impl From<&HandshakeError> for HttpResponse {
    fn from(err: &HandshakeError) -> Self {
        HttpResponse::Error {
            status: err.status_code(),
            message: err.public_message(),
        }
    }
}

/// What the framework must do with its session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    Unchanged,
    Established(SessionId),
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointResponse {
    pub response: HttpResponse,
    pub session: SessionChange,
    /// Set on login: the value of the login cookie.
    pub login_nonce: Option<String>,
}

impl EndpointResponse {
    fn new(response: HttpResponse, session: SessionChange) -> Self {
        Self {
            response,
            session,
            login_nonce: None,
        }
    }

    fn error(status: u16, message: &'static str) -> Self {
        Self::new(
            HttpResponse::Error { status, message },
            SessionChange::Unchanged,
        )
    }

    fn failed(err: &HandshakeError, session: SessionChange) -> Self {
        Self::new(err.into(), session)
    }
}

enum Route<'a> {
    Login(Option<&'a str>),
    Acs(&'a str),
    Metadata(&'a str),
    Sls(&'a str),
    Logout(&'a str),
}

fn route(path: &str) -> Option<Route<'_>> {
    let mut segments = path.trim_matches('/').split('/');
    let route = match (segments.next()?, segments.next()) {
        ("login", idp) => Route::Login(idp),
        ("acs", Some(idp)) => Route::Acs(idp),
        ("metadata", Some(idp)) => Route::Metadata(idp),
        ("sls", Some(idp)) => Route::Sls(idp),
        ("logout", Some(idp)) => Route::Logout(idp),
        _ => return None,
    };
    if segments.next().is_some() {
        return None;
    }
    Some(route)
}

pub struct Endpoints {
    orchestrator: Orchestrator,
    prefix: String,
}

impl Endpoints {
    /// `prefix` is the mount point, e.g. `/saml`.
    pub fn new(orchestrator: Orchestrator, prefix: &str) -> Self {
        Self {
            orchestrator,
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn handle(&self, request: &HttpRequest) -> EndpointResponse {
        let Some(path) = request.path.strip_prefix(&self.prefix) else {
            return EndpointResponse::error(404, "not found");
        };
        let Some(route) = route(path) else {
            return EndpointResponse::error(404, "not found");
        };
        debug!(path = %request.path, "saml endpoint");

        match (route, request.method) {
            (Route::Login(idp), Method::Get | Method::Post) => self.login(request, idp),
            (Route::Acs(idp), Method::Post) => self.acs(request, idp),
            (Route::Metadata(idp), Method::Get) => self.metadata(idp),
            (Route::Sls(idp), Method::Get | Method::Post) => self.sls(request, idp),
            (Route::Logout(idp), Method::Get | Method::Post) => self.logout(request, idp),
            _ => EndpointResponse::error(405, "method not allowed"),
        }
    }

    fn login(&self, request: &HttpRequest, idp: Option<&str>) -> EndpointResponse {
        let params = request.params();
        let Some(idp) = idp.or(params.get("idp").map(String::as_str)) else {
            return EndpointResponse::error(400, "bad request");
        };
        match self.orchestrator.login(
            idp,
            params.get("next").map(String::as_str),
            &request.host,
            request.session.as_ref(),
        ) {
            Ok(login) => EndpointResponse {
                login_nonce: Some(login.browser_nonce),
                ..EndpointResponse::new(
                    HttpResponse::Redirect { location: login.url },
                    SessionChange::Unchanged,
                )
            },
            Err(err) => EndpointResponse::failed(&err, SessionChange::Unchanged),
        }
    }

    fn acs(&self, request: &HttpRequest, idp: &str) -> EndpointResponse {
        let form = request.form_params();
        let Some(saml_response) = form.get("SAMLResponse") else {
            warn!(idp, reason = "missing_saml_response", "ACS request without SAMLResponse");
            return EndpointResponse::error(400, "bad request");
        };
        match self.orchestrator.authorized(
            idp,
            saml_response,
            form.get("RelayState").map(String::as_str),
            request.login_nonce.as_deref(),
            &request.host,
            request.session.as_ref(),
        ) {
            Ok(outcome) => EndpointResponse::new(
                HttpResponse::Redirect {
                    location: outcome.redirect_to.into_string(),
                },
                SessionChange::Established(outcome.session.id),
            ),
            // A failed callback never leaves the previous session in place.
            Err(err) => {
                let session = match request.session {
                    Some(id) => {
                        if let Err(store) = self.orchestrator.sessions().terminate(&id) {
                            warn!(idp, reason = "store", error = %store, "failed to clear session");
                        }
                        SessionChange::Cleared
                    }
                    None => SessionChange::Unchanged,
                };
                EndpointResponse::failed(&err, session)
            }
        }
    }

    fn metadata(&self, idp: &str) -> EndpointResponse {
        match self.orchestrator.metadata(idp) {
            Ok(body) => EndpointResponse::new(HttpResponse::Xml { body }, SessionChange::Unchanged),
            Err(err) => EndpointResponse::failed(&err, SessionChange::Unchanged),
        }
    }

    fn sls(&self, request: &HttpRequest, idp: &str) -> EndpointResponse {
        let params = request.params();
        let cleared = match request.session {
            Some(_) => SessionChange::Cleared,
            None => SessionChange::Unchanged,
        };
        let Some(saml_response) = params.get("SAMLResponse") else {
            // IdP-initiated LogoutRequests are not handled.
            warn!(idp, reason = "unsupported_sls_message", "SLS request without SAMLResponse");
            return EndpointResponse::error(400, "bad request");
        };
        let binding = match request.method {
            Method::Post => ProtocolBinding::Post,
            _ => ProtocolBinding::Redirect,
        };
        match self.orchestrator.logout_callback(
            idp,
            saml_response,
            params.get("RelayState").map(String::as_str),
            binding,
            request.session.as_ref(),
            &request.host,
        ) {
            Ok(target) => EndpointResponse::new(
                HttpResponse::Redirect {
                    location: target.into_string(),
                },
                cleared,
            ),
            Err(err) => EndpointResponse::failed(&err, cleared),
        }
    }

    fn logout(&self, request: &HttpRequest, idp: &str) -> EndpointResponse {
        let params = request.params();
        let cleared = match request.session {
            Some(_) => SessionChange::Cleared,
            None => SessionChange::Unchanged,
        };
        match self.orchestrator.logout(
            idp,
            request.session.as_ref(),
            params.get("next").map(String::as_str),
            &request.host,
        ) {
            Ok(LogoutOutcome::IdpRedirect { url, .. }) => {
                EndpointResponse::new(HttpResponse::Redirect { location: url }, cleared)
            }
            Ok(LogoutOutcome::Local { redirect_to }) => EndpointResponse::new(
                HttpResponse::Redirect {
                    location: redirect_to.into_string(),
                },
                cleared,
            ),
            Err(err) => EndpointResponse::failed(&err, cleared),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use url::Url;

    use crate::{
        account::MemoryAccountStore,
        settings::SharedRegistry,
        testing::{sample_registry, sample_settings, FakeResponse, MemoryToolkit},
        utils::{Clock, SystemClock},
        STATUS_SUCCESS,
    };

    use super::*;

    const HOST: &str = "app.example";

    fn endpoints() -> (Endpoints, Arc<MemoryToolkit>) {
        let toolkit = Arc::new(MemoryToolkit::new());
        let orchestrator = Orchestrator::new(
            Arc::new(SharedRegistry::new(sample_registry())),
            toolkit.clone(),
            Arc::new(MemoryAccountStore::new()),
        );
        (Endpoints::new(orchestrator, "/saml/"), toolkit)
    }

    fn relay_state(location: &str) -> String {
        Url::parse(location)
            .unwrap()
            .query_pairs()
            .find(|(name, _)| name == "RelayState")
            .map(|(_, value)| value.into_owned())
            .unwrap()
    }

    fn log_in(endpoints: &Endpoints, toolkit: &MemoryToolkit) -> (SessionId, String) {
        let login = endpoints.handle(&HttpRequest::get(HOST, "/saml/login/idp1?next=/dashboard"));
        let HttpResponse::Redirect { location } = login.response else {
            panic!("expected redirect");
        };
        let request_id = relay_state(&location);
        let token = toolkit.issue(FakeResponse::for_request(
            &sample_settings(),
            &request_id,
            "user@example.org",
            SystemClock.now(),
        ));
        let acs = endpoints.handle(
            &HttpRequest::post_form(
                HOST,
                "/saml/acs/idp1",
                [("SAMLResponse", token.as_str()), ("RelayState", request_id.as_str())],
            )
            .with_login_nonce(login.login_nonce),
        );
        let SessionChange::Established(session) = acs.session else {
            panic!("expected a session");
        };
        let HttpResponse::Redirect { location } = acs.response else {
            panic!("expected redirect");
        };
        (session, location)
    }

    #[test]
    fn can_log_in_through_endpoints() {
        let (endpoints, toolkit) = endpoints();
        let (_, location) = log_in(&endpoints, &toolkit);
        assert_eq!(location, "/dashboard");
    }

    #[test]
    fn acs_requires_the_login_cookie() {
        let (endpoints, toolkit) = endpoints();
        let login = endpoints.handle(&HttpRequest::get(HOST, "/saml/login/idp1"));
        assert!(login.login_nonce.is_some());
        let HttpResponse::Redirect { location } = login.response else {
            panic!("expected redirect");
        };
        let request_id = relay_state(&location);
        let token = toolkit.issue(FakeResponse::for_request(
            &sample_settings(),
            &request_id,
            "user@example.org",
            SystemClock.now(),
        ));

        let acs = endpoints.handle(&HttpRequest::post_form(
            HOST,
            "/saml/acs/idp1",
            [("SAMLResponse", token.as_str()), ("RelayState", request_id.as_str())],
        ));
        assert_eq!(acs.response.status(), 403);
        assert_eq!(acs.session, SessionChange::Unchanged);
    }

    #[test]
    fn login_accepts_idp_query_parameter() {
        let (endpoints, _) = endpoints();
        let response = endpoints.handle(&HttpRequest::get(HOST, "/saml/login?idp=idp1"));
        assert_eq!(response.response.status(), 302);

        let missing = endpoints.handle(&HttpRequest::get(HOST, "/saml/login"));
        assert_eq!(missing.response.status(), 400);
    }

    #[test]
    fn failures_map_to_generic_responses() {
        let (endpoints, _) = endpoints();
        let unknown = endpoints.handle(&HttpRequest::get(HOST, "/saml/login/nope"));
        assert_eq!(unknown.response.status(), 404);

        let unsafe_next = endpoints.handle(&HttpRequest::get(
            HOST,
            "/saml/login/idp1?next=https://evil.example/x",
        ));
        assert_eq!(unsafe_next.response.status(), 400);

        let forged = endpoints.handle(&HttpRequest::post_form(
            HOST,
            "/saml/acs/idp1",
            [("SAMLResponse", "x"), ("RelayState", "_unknown")],
        ));
        assert_eq!(
            forged.response,
            HttpResponse::Error {
                status: 403,
                message: crate::GENERIC_FAILURE
            }
        );
    }

    #[test]
    fn can_serve_metadata() {
        let (endpoints, _) = endpoints();
        let response = endpoints.handle(&HttpRequest::get(HOST, "/saml/metadata/idp1"));
        assert_eq!(response.response.content_type(), Some("text/xml"));
        assert_eq!(response.session, SessionChange::Unchanged);
    }

    #[test]
    fn unknown_paths_and_methods_are_refused() {
        let (endpoints, _) = endpoints();
        assert_eq!(
            endpoints
                .handle(&HttpRequest::get(HOST, "/other/login/idp1"))
                .response
                .status(),
            404
        );
        assert_eq!(
            endpoints
                .handle(&HttpRequest::get(HOST, "/saml/acs/idp1"))
                .response
                .status(),
            405
        );
    }

    #[test]
    fn can_log_out_through_idp() {
        let (endpoints, toolkit) = endpoints();
        let (session, _) = log_in(&endpoints, &toolkit);

        let logout = endpoints
            .handle(&HttpRequest::get(HOST, "/saml/logout/idp1?next=/bye").with_session(Some(session)));
        assert_eq!(logout.session, SessionChange::Cleared);
        let HttpResponse::Redirect { location } = logout.response else {
            panic!("expected redirect");
        };
        let request_id = relay_state(&location);

        let token = toolkit.issue_logout(&sample_settings(), &request_id, STATUS_SUCCESS);
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("SAMLResponse", &token)
            .append_pair("RelayState", &request_id)
            .finish();
        let callback = endpoints.handle(&HttpRequest::get(HOST, &format!("/saml/sls/idp1?{query}")));
        assert_eq!(
            callback.response,
            HttpResponse::Redirect {
                location: "/bye".into()
            }
        );
    }

    #[test]
    fn sls_refuses_logout_requests() {
        let (endpoints, _) = endpoints();
        let response = endpoints.handle(&HttpRequest::get(HOST, "/saml/sls/idp1?SAMLRequest=abc"));
        assert_eq!(response.response.status(), 400);
    }
}
