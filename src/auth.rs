use std::{collections::HashMap, sync::Arc};

use axum::http::HeaderMap;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::flexjson::{get_ci, get_int, get_string};

pub const SESSION_COOKIE: &str = "wa_console_sid";
pub const TOKEN_COOKIE: &str = "jwt_token";

const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Strips a `Bearer ` prefix and surrounding quotes off a raw token value.
pub fn cleanup_token(raw: &str) -> String {
    let mut s = raw.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s = s[1..s.len() - 1].trim();
    }
    if s
        .get(..7)
        .map(|p| p.eq_ignore_ascii_case("bearer "))
        .unwrap_or(false)
    {
        s = s[7..].trim();
    }
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s = s[1..s.len() - 1].trim();
    }
    s.to_string()
}

/// Decodes the payload segment of a JWT without verifying the signature.
/// The remote API is the authority on validity; this is only used to read
/// the expiry and tenant claims locally.
pub fn jwt_payload(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let bytes = engine
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = jwt_payload(token)?;
    let exp = get_ci(&payload, "exp")?;
    let secs = exp
        .as_i64()
        .or_else(|| exp.as_str().and_then(|s| s.trim().parse::<i64>().ok()))?;
    DateTime::<Utc>::from_timestamp(secs, 0)
}

/// Expired when now >= exp - 60s. A token whose payload cannot be decoded has
/// no known expiry and is treated as not expired (fail open).
pub fn token_expired(token: &str) -> bool {
    token_expired_at(token, Utc::now())
}

pub fn token_expired_at(token: &str, now: DateTime<Utc>) -> bool {
    match jwt_expiry(token) {
        Some(exp) => now >= exp - ChronoDuration::seconds(EXPIRY_SKEW_SECONDS),
        None => false,
    }
}

pub fn jwt_claim_string(token: &str, name: &str) -> Option<String> {
    let payload = jwt_payload(token)?;
    get_string(&payload, &[name])
}

pub fn jwt_claim_int(token: &str, names: &[&str]) -> Option<i64> {
    let payload = jwt_payload(token)?;
    get_int(&payload, names)
}

#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub token: String,
    pub tenant_id: String,
    pub tenant_name: String,
    pub user_id: String,
    pub user_name: String,
    pub role: String,
}

struct SessionEntry {
    context: SessionContext,
    expires_at: DateTime<Utc>,
}

fn session_ttl() -> ChronoDuration {
    ChronoDuration::hours(2)
}

/// Process-local session store keyed by an opaque cookie id. Sliding expiry:
/// every successful lookup pushes the deadline out another two hours.
#[derive(Default)]
pub struct SessionStore {
    entries: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub async fn create(&self, context: SessionContext) -> String {
        let sid = Uuid::new_v4().to_string();
        let entry = SessionEntry {
            context,
            expires_at: Utc::now() + session_ttl(),
        };
        self.entries.lock().await.insert(sid.clone(), entry);
        sid
    }

    pub async fn get(&self, sid: &str) -> Option<SessionContext> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        match entries.get_mut(sid) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + session_ttl();
                Some(entry.context.clone())
            }
            Some(_) => {
                entries.remove(sid);
                None
            }
            None => None,
        }
    }

    /// Drops only the token, forcing re-authentication while keeping the
    /// session row addressable until it ages out.
    pub async fn clear_token(&self, sid: &str) {
        if let Some(entry) = self.entries.lock().await.get_mut(sid) {
            entry.context.token.clear();
        }
    }

    pub async fn remove(&self, sid: &str) {
        self.entries.lock().await.remove(sid);
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthHeaders {
    pub token: String,
    pub tenant_id: String,
}

/// Resolves the bearer token and tenant id for one outbound call. Re-reads
/// the session store every time so a 401 retry can pick up concurrent
/// session changes.
#[derive(Clone)]
pub struct AuthResolver {
    store: Arc<SessionStore>,
    sid: Option<String>,
    cookie_token: Option<String>,
    tenant_fallback: String,
}

impl AuthResolver {
    pub fn new(
        store: Arc<SessionStore>,
        sid: Option<String>,
        cookie_token: Option<String>,
        tenant_fallback: String,
    ) -> Self {
        Self {
            store,
            sid,
            cookie_token,
            tenant_fallback,
        }
    }

    pub async fn resolve(&self) -> AuthHeaders {
        let session = match &self.sid {
            Some(sid) => self.store.get(sid).await,
            None => None,
        };

        let raw = session
            .as_ref()
            .map(|s| s.token.clone())
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.cookie_token.clone())
            .unwrap_or_default();
        let mut token = cleanup_token(&raw);

        if !token.is_empty() && token_expired(&token) {
            token.clear();
            if let Some(sid) = &self.sid {
                self.store.clear_token(sid).await;
            }
        }

        let tenant_id = self.resolve_tenant(session.as_ref(), &token);
        AuthHeaders { token, tenant_id }
    }

    fn resolve_tenant(&self, session: Option<&SessionContext>, token: &str) -> String {
        if let Some(s) = session {
            let t = s.tenant_id.trim();
            if !t.is_empty() && t != "0" {
                return t.to_string();
            }
        }
        if !token.is_empty() {
            if let Some(id) = jwt_claim_int(token, &["empresa_id", "EmpresaId", "empresaId"]) {
                if id > 0 {
                    return id.to_string();
                }
            }
            if let Some(id) = jwt_claim_string(token, "empresa_id") {
                if !id.trim().is_empty() && id != "0" {
                    return id;
                }
            }
        }
        let fb = self.tenant_fallback.trim();
        if fb.is_empty() {
            "0".to_string()
        } else {
            fb.to_string()
        }
    }
}

/// Pulls one value out of the request `Cookie` header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?.trim();
        if key == name {
            return Some(parts.next().unwrap_or("").trim().to_string());
        }
    }
    None
}
