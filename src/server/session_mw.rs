//! Session cookie middleware
//!
//! Attaches a [`SessionContext`] to every request. A presented cookie
//! must be exactly 32 lowercase hex characters; anything else is
//! treated as absent and replaced with a freshly generated id, set on
//! the response with `HttpOnly` and `SameSite=Strict` (loopback trust
//! model: the cookie is an identity, not a credential).

use axum::extract::{Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::middleware::Next;
use axum::response::Response;

use crate::server::AppState;
use crate::session::{generate_session_id, is_valid_session_id};

/// Cookie name carrying the session id.
pub const SESSION_COOKIE: &str = "session";

/// Session identity attached to the request extensions.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// The 32-hex session id
    pub id: String,
    /// True when the id was issued on this request (no valid cookie
    /// was presented)
    pub issued: bool,
}

/// Extracts the session cookie value from a Cookie header, if any.
fn cookie_value(request: &Request) -> Option<String> {
    let header = request.headers().get(COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Middleware: resolve or issue the session id, set the cookie when a
/// fresh id was issued.
pub async fn session_cookie(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let presented = cookie_value(&request).filter(|v| is_valid_session_id(v));
    let (id, issued) = match presented {
        Some(id) => (id, false),
        None => (generate_session_id(), true),
    };

    request.extensions_mut().insert(SessionContext {
        id: id.clone(),
        issued,
    });

    let mut response = next.run(request).await;

    if issued {
        let max_age = state.config.limits.session_idle_hours * 3600;
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
            SESSION_COOKIE, id, max_age
        );
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }

    response
}
