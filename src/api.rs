use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use crate::{
    auth::{AuthHeaders, AuthResolver},
    flexjson::{extract_records, get_bool, get_date, get_int, get_string},
    types::{Contact, Conversation, MessageRecord, UserRecord},
};

pub const TENANT_HEADER: &str = "x-empresa-id";
const AGENT_PROFILE_ID: i64 = 1;

#[derive(Debug, Clone, Default)]
pub struct SendResult {
    pub conversation_id: Option<i64>,
    pub just_created: bool,
}

/// Thin wrapper over the remote business API. Headers are resolved per call
/// so a retry after 401 can pick up fresh session state.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("{}/", base_url.trim_end_matches('/')),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    fn build(&self, method: &Method, path: &str, body: Option<&Value>, auth: &AuthHeaders) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method.clone(), self.url(path))
            .header(TENANT_HEADER, &auth.tenant_id)
            .header(reqwest::header::ACCEPT, "application/json");
        if !auth.token.is_empty() {
            req = req.bearer_auth(&auth.token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req
    }

    async fn send_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        resolver: &AuthResolver,
    ) -> Result<reqwest::Response, String> {
        let auth = resolver.resolve().await;
        log_outbound(&method, path, &auth);
        let response = self
            .build(&method, path, body, &auth)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status() != StatusCode::UNAUTHORIZED {
            tracing::debug!(status = %response.status(), path, "api response");
            return Ok(response);
        }

        // One retry with re-resolved credentials; a second 401 goes back to
        // the caller untouched.
        let auth = resolver.resolve().await;
        tracing::info!(path, "retrying after 401 with refreshed credentials");
        let retried = self
            .build(&method, path, body, &auth)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        tracing::debug!(status = %retried.status(), path, "api response (retry)");
        Ok(retried)
    }

    /// GET a collection endpoint and unwrap whatever envelope it came in.
    pub async fn get_records(&self, path: &str, resolver: &AuthResolver) -> Result<Vec<Value>, String> {
        let response = self.send_with_retry(Method::GET, path, None, resolver).await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(format!("API {}: {}", status.as_u16(), truncate(&body, 200)));
        }
        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        Ok(extract_records(&parsed))
    }

    pub async fn fetch_contacts(&self, resolver: &AuthResolver) -> Result<Vec<Value>, String> {
        self.get_records("api/general/contacto", resolver).await
    }

    pub async fn fetch_conversations(&self, resolver: &AuthResolver) -> Result<Vec<Value>, String> {
        self.get_records("api/general/conversacion", resolver).await
    }

    pub async fn fetch_messages(&self, resolver: &AuthResolver) -> Result<Vec<Value>, String> {
        self.get_records("api/general/mensaje", resolver).await
    }

    pub async fn fetch_users(&self, resolver: &AuthResolver) -> Result<Vec<UserRecord>, String> {
        let records = self.get_records("api/seguridad/usuario", resolver).await?;
        Ok(records.iter().filter_map(map_user).collect())
    }

    /// Agent roster. The dedicated endpoint is preferred; when it fails the
    /// full user list filtered by profile id serves as fallback.
    pub async fn fetch_agents(&self, resolver: &AuthResolver) -> Result<Vec<UserRecord>, String> {
        let path = format!("api/seguridad/usuario/by-perfil-id/{AGENT_PROFILE_ID}");
        match self.get_records(&path, resolver).await {
            Ok(records) => Ok(records.iter().filter_map(map_user).collect()),
            Err(err) => {
                tracing::warn!(error = %err, "agent endpoint failed, falling back to user list");
                let all = self.fetch_users(resolver).await?;
                Ok(all
                    .into_iter()
                    .filter(|u| u.profile_id.unwrap_or(0) == AGENT_PROFILE_ID)
                    .collect())
            }
        }
    }

    pub async fn update_user_name(&self, id: i64, name: &str, resolver: &AuthResolver) -> Result<(), String> {
        let path = format!("api/seguridad/usuario/{id}/nombre");
        let body = json!({ "Nombre": name });
        let response = self
            .send_with_retry(Method::PATCH, &path, Some(&body), resolver)
            .await?;
        expect_success(response).await
    }

    pub async fn update_contact_name(&self, id: i64, name: &str, resolver: &AuthResolver) -> Result<(), String> {
        let path = format!("api/general/contacto/{id}/nombre");
        let body = json!({ "Name": name });
        let response = self
            .send_with_retry(Method::PATCH, &path, Some(&body), resolver)
            .await?;
        expect_success(response).await
    }

    /// Login carries no tenant or bearer headers.
    pub async fn login(&self, username: &str, password: &str) -> Result<Value, String> {
        let body = json!({
            "nombreUsuario": username,
            "contrasenia": password,
            "loginApp": true,
        });
        let response = self
            .http
            .post(self.url("api/auth/login"))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("No se pudo contactar la API: {e}"))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(format!(
                "Credenciales inválidas o error en API. ({}) {}",
                status.as_u16(),
                truncate(&text, 200)
            ));
        }
        serde_json::from_str(&text).map_err(|e| e.to_string())
    }

    pub async fn send_text(&self, payload: &Value, resolver: &AuthResolver) -> Result<SendResult, String> {
        let response = self
            .send_with_retry(
                Method::POST,
                "api/integraciones/whatsapp/send/text",
                Some(payload),
                resolver,
            )
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        let Ok(parsed) = serde_json::from_str::<Value>(&body) else {
            if status.is_success() {
                return Ok(SendResult::default());
            }
            return Err(format!("API {}: {}", status.as_u16(), truncate(&body, 200)));
        };

        let ok = get_bool(&parsed, &["exitoso"]).unwrap_or(false);
        if !status.is_success() || !ok {
            let msg = get_string(&parsed, &["mensaje"]).unwrap_or_else(|| truncate(&body, 200));
            return Err(format!("API {}: {}", status.as_u16(), msg));
        }
        Ok(SendResult {
            conversation_id: get_int(&parsed, &["conversacion_id"]),
            just_created: get_bool(&parsed, &["just_created"]).unwrap_or(false),
        })
    }

    pub async fn upsert_conversation(&self, payload: &Value, resolver: &AuthResolver) -> Result<(), String> {
        let response = self
            .send_with_retry(
                Method::POST,
                "api/general/conversacion/upsert",
                Some(payload),
                resolver,
            )
            .await?;
        expect_success(response).await
    }
}

async fn expect_success(response: reqwest::Response) -> Result<(), String> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("API {}: {}", status.as_u16(), truncate(&body, 200)))
}

fn log_outbound(method: &Method, path: &str, auth: &AuthHeaders) {
    tracing::info!(%method, path, auth = %auth_preview(&auth.token), tenant = %auth.tenant_id, "api request");
}

/// Never logs the full token; the preview is clipped at a char boundary.
fn auth_preview(token: &str) -> String {
    if token.is_empty() {
        "(none)".to_string()
    } else {
        format!("Bearer {}", truncate(token, 10))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

// ===== record mapping =====

pub fn map_contact(record: &Value) -> Contact {
    Contact {
        id: get_int(record, &["id"]).unwrap_or(0),
        name: get_string(record, &["name", "nombre", "fullName", "full_name"]).unwrap_or_default(),
        phone_number: get_string(record, &["phoneNumber", "phone_number", "telefono"]).unwrap_or_default(),
        country: get_string(record, &["country", "pais"]).unwrap_or_default(),
        ip_address: get_string(record, &["ipAddress", "ip_address"]).unwrap_or_default(),
        created_at: get_date(record, &["createdAt", "created_at", "fechaCreacion", "created", "createdDate"]),
        last_message_at: get_date(record, &["lastMessageAt", "last_message_at"]),
        profile_pic: get_string(record, &["profilePic", "profile_pic", "profilePicture"]).unwrap_or_default(),
        status: get_string(record, &["status", "estado"]).unwrap_or_default(),
        welcome_sent: get_bool(record, &["welcomeSent", "welcome_sent"]).unwrap_or(false),
    }
}

pub fn map_conversation(record: &Value) -> Conversation {
    Conversation {
        id: get_int(record, &["id"]).unwrap_or(0),
        contact_id: get_int(record, &["contactId", "contact_id"]).unwrap_or(0),
        started_at: get_date(record, &["startedAt", "started_at"]),
        last_activity_at: get_date(record, &["lastActivityAt", "last_activity_at"]),
        greeting_sent: get_bool(record, &["greetingSent", "greeting_sent"]).unwrap_or(false),
        status: get_string(record, &["status", "estado"]).unwrap_or_else(|| "open".into()),
        ended_at: get_date(record, &["endedAt", "ended_at", "closedAt", "closed_at", "fechaCierre"]),
        closed_by_user_id: get_int(record, &["closedByUserId", "closed_by_user_id", "closedById"]),
        agent_requested_at: get_date(record, &["agentRequestedAt", "agent_requested_at"]),
        total_messages: get_int(record, &["totalMessages", "total_messages"]).unwrap_or(0),
    }
}

pub fn map_message(record: &Value) -> MessageRecord {
    MessageRecord {
        id: get_int(record, &["id"]).unwrap_or(0),
        conversation_id: get_int(record, &["conversationId", "conversation_id"]).unwrap_or(0),
        contact_id: get_int(record, &["contactId", "contact_id", "contactoId"]).unwrap_or(0),
        agent_id: get_int(record, &["agentId", "agent_id"]),
        sender: get_string(record, &["sender"]).unwrap_or_else(|| "contact".into()),
        body: get_string(record, &["message", "text", "contenido"]).unwrap_or_default(),
        kind: get_string(record, &["type", "tipo"]).unwrap_or_else(|| "text".into()),
        media_path: get_string(record, &["mediaPath", "media_path"]).unwrap_or_default(),
        sent_at: get_date(record, &["sentAt", "sent_at", "timestamp", "createdAt", "fecha"]),
    }
}

/// Users come back under wildly different field names across endpoints.
/// Records with no id, name, or email are upstream noise and are skipped.
pub fn map_user(record: &Value) -> Option<UserRecord> {
    let user = UserRecord {
        id: get_int(record, &["id", "usuarioId", "userId"]).unwrap_or(0),
        name: get_string(record, &["nombre", "name", "nombreUsuario", "usuario"]).unwrap_or_default(),
        email: get_string(record, &["correo", "email"]).unwrap_or_default(),
        phone: get_string(record, &["telefono", "phone"]).unwrap_or_default(),
        active: get_bool(record, &["estado", "activo", "isActive"]),
        profile_id: get_int(record, &["idPerfil", "perfilId"]),
        company: get_string(record, &["empresa"]).unwrap_or_default(),
        tenant_id: get_int(record, &["empresaId", "empresaID"]),
        last_login: get_date(record, &["lastLogin", "ultimoAcceso"]),
        last_activity: get_date(record, &["lastActivity", "ultimoMovimiento"]),
        is_online: get_bool(record, &["isOnline", "online", "conectado"]).unwrap_or(false),
        conversation_count: get_int(record, &["conversationCount", "totalConversaciones"]).unwrap_or(0),
    };
    if user.id == 0 && user.email.is_empty() && user.name.is_empty() {
        return None;
    }
    Some(user)
}

// ===== relay seam =====

/// The slice of the remote API the chat relay needs. Split out as a trait so
/// the relay flows can be exercised against a recording mock.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn conversations(&self) -> Result<Vec<Value>, String>;
    async fn contacts(&self) -> Result<Vec<Value>, String>;
    async fn send_text(&self, payload: Value) -> Result<SendResult, String>;
    async fn upsert_conversation(&self, payload: Value) -> Result<(), String>;
}

/// `ApiClient` bound to one request's credential resolver.
pub struct BoundApi<'a> {
    pub client: &'a ApiClient,
    pub resolver: &'a AuthResolver,
}

#[async_trait]
impl RemoteApi for BoundApi<'_> {
    async fn conversations(&self) -> Result<Vec<Value>, String> {
        self.client.fetch_conversations(self.resolver).await
    }

    async fn contacts(&self) -> Result<Vec<Value>, String> {
        self.client.fetch_contacts(self.resolver).await
    }

    async fn send_text(&self, payload: Value) -> Result<SendResult, String> {
        self.client.send_text(&payload, self.resolver).await
    }

    async fn upsert_conversation(&self, payload: Value) -> Result<(), String> {
        self.client.upsert_conversation(&payload, self.resolver).await
    }
}
