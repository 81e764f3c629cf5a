use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{
    api::{map_contact, map_conversation, map_message, RemoteApi, SendResult},
    auth::{
        cleanup_token, cookie_value, jwt_claim_int, token_expired, AuthResolver, SessionContext,
        SESSION_COOKIE, TOKEN_COOKIE,
    },
    autoclose::{AutoCloseScheduler, AUTO_CLOSE_AFTER},
    flexjson::{get_bool, get_ci, get_date, get_int, get_string},
    types::*,
    views,
};

const MONTHS_ES: [&str; 12] = [
    "ene", "feb", "mar", "abr", "may", "jun", "jul", "ago", "sep", "oct", "nov", "dic",
];

const CLOSED_WORDS: [&str; 9] = [
    "closed",
    "cerrada",
    "cerrado",
    "finalizada",
    "finalizado",
    "terminada",
    "terminated",
    "ended",
    "finalized",
];

const CLOSING_NOTICE: &str = "Tu ticket ha sido cerrado. Si necesitas más ayuda, por favor crea un nuevo ticket respondiendo a este chat.";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/account/login", get(login_page).post(login_submit))
        .route("/account/logout", post(logout))
        .route("/dashboard", get(dashboard_page))
        .route("/agents", get(agents_page))
        .route("/agents/closed-by-agent", get(agents_closed_by_agent))
        .route("/agents/update-name", post(agents_update_name))
        .route("/contacts", get(contacts_page))
        .route("/contacts/update-name", post(contacts_update_name))
        .route("/reports", get(reports_page))
        .route("/reports/series", get(reports_series))
        .route("/reports/agent-closures", get(reports_agent_closures))
        .route("/reports/top-clients", get(reports_top_clients))
        .route("/reports/kpis", get(reports_kpis))
        .route("/chat", get(chat_page))
        .route("/chat/conversations", get(chat_conversations))
        .route("/chat/messages", get(chat_messages))
        .route("/chat/all-conversations", get(chat_all_conversations))
        .route("/chat/send", post(chat_send))
        .route("/chat/status", post(chat_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ===== session plumbing =====

fn resolver_for(state: &AppState, headers: &HeaderMap) -> AuthResolver {
    AuthResolver::new(
        Arc::clone(&state.sessions),
        cookie_value(headers, SESSION_COOKIE),
        cookie_value(headers, TOKEN_COOKIE),
        state.config.tenant_id_fallback.clone(),
    )
}

/// Validates the session for a page request. On failure the browser is sent
/// to the login form with the original path preserved as `returnUrl`.
async fn page_session(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<SessionContext, Response> {
    match live_session(state, headers).await {
        Some(session) => Ok(session),
        None => {
            let target = match uri.query() {
                Some(q) => format!("{}?{}", uri.path(), q),
                None => uri.path().to_string(),
            };
            Err(Redirect::to(&format!("/account/login?returnUrl={}", url_encode(&target)))
                .into_response())
        }
    }
}

/// Validates the session for a JSON endpoint; failures get a bare 401.
async fn json_session(state: &AppState, headers: &HeaderMap) -> Result<SessionContext, Response> {
    match live_session(state, headers).await {
        Some(session) => Ok(session),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "Sesión expirada." })),
        )
            .into_response()),
    }
}

async fn live_session(state: &AppState, headers: &HeaderMap) -> Option<SessionContext> {
    let sid = cookie_value(headers, SESSION_COOKIE)?;
    let session = state.sessions.get(&sid).await?;
    if session.token.trim().is_empty() {
        return None;
    }
    if token_expired(&session.token) {
        state.sessions.remove(&sid).await;
        return None;
    }
    Some(session)
}

fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn is_local_url(value: &str) -> bool {
    value.starts_with('/') && !value.starts_with("//")
}

fn session_cookie(sid: &str) -> String {
    format!("{SESSION_COOKIE}={sid}; Path=/; HttpOnly; SameSite=Lax")
}

fn expired_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

fn api_error_page(err: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Html(format!("<p>Error consultando la API: {err}</p>")),
    )
        .into_response()
}

fn domain_failure(reason: &str) -> Response {
    Json(json!({ "success": false, "error": reason })).into_response()
}

// ===== account =====

async fn root(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if live_session(&state, &headers).await.is_some() {
        Redirect::to("/dashboard").into_response()
    } else {
        Redirect::to("/account/login").into_response()
    }
}

async fn login_page(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReturnUrlQuery>,
) -> Response {
    if live_session(&state, &headers).await.is_some() {
        return Redirect::to("/dashboard").into_response();
    }
    Html(views::render_login(None, &query.return_url)).into_response()
}

async fn login_submit(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Response {
    let username = form.email.trim();
    let password = form.password.trim();
    if username.is_empty() || password.is_empty() {
        return Html(views::render_login(
            Some("Ingrese usuario y contraseña."),
            &form.return_url,
        ))
        .into_response();
    }

    let payload = match state.api.login(username, password).await {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(user = username, error = %err, "login failed");
            return Html(views::render_login(Some(&err), &form.return_url)).into_response();
        }
    };

    let Some(raw_token) = find_token(&payload) else {
        return Html(views::render_login(
            Some("La API no devolvió un token de acceso."),
            &form.return_url,
        ))
        .into_response();
    };
    let token = cleanup_token(&raw_token);
    let user = find_user(&payload);

    let role_raw = get_string(&user, &["rol", "role", "perfil"]);
    let profile_id = get_int(&user, &["idPerfil", "perfilId", "profileId"]);
    let role = normalize_role(role_raw.as_deref(), profile_id);

    let tenant_id = get_int(&user, &["empresaId", "empresaID", "empresa_id"])
        .filter(|id| *id > 0)
        .map(|id| id.to_string())
        .or_else(|| {
            jwt_claim_int(&token, &["empresa_id", "EmpresaId", "empresaId"])
                .filter(|id| *id > 0)
                .map(|id| id.to_string())
        })
        .unwrap_or_else(|| state.config.tenant_id_fallback.clone());

    let context = SessionContext {
        token,
        tenant_id,
        tenant_name: get_string(&user, &["empresa", "empresaNombre", "nombreEmpresa"])
            .unwrap_or_default(),
        user_id: get_int(&user, &["id", "usuarioId"]).unwrap_or(0).to_string(),
        user_name: get_string(&user, &["nombre", "name", "nombreUsuario"])
            .unwrap_or_else(|| username.to_string()),
        role,
    };
    tracing::info!(user = %context.user_name, role = %context.role, tenant = %context.tenant_id, "login ok");
    let sid = state.sessions.create(context).await;

    let target = if is_local_url(form.return_url.trim()) {
        form.return_url.trim().to_string()
    } else {
        "/dashboard".to_string()
    };
    (
        [(header::SET_COOKIE, session_cookie(&sid))],
        Redirect::to(&target),
    )
        .into_response()
}

async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(sid) = cookie_value(&headers, SESSION_COOKIE) {
        state.sessions.remove(&sid).await;
    }
    (
        [(header::SET_COOKIE, expired_session_cookie())],
        Redirect::to("/account/login"),
    )
        .into_response()
}

/// Token may sit at the top level, one level under a wrapper, or inside an
/// arbitrary nested object depending on the API version.
pub(crate) fn find_token(payload: &Value) -> Option<String> {
    const NAMES: [&str; 3] = ["token", "accessToken", "jwt"];
    if let Some(token) = get_string(payload, &NAMES) {
        return Some(token);
    }
    for wrapper in ["data", "objeto", "result"] {
        if let Some(inner) = get_ci(payload, wrapper) {
            if let Some(token) = get_string(inner, &NAMES) {
                return Some(token);
            }
        }
    }
    for value in payload.as_object().map(|m| m.values()).into_iter().flatten() {
        if value.is_object() {
            if let Some(token) = get_string(value, &NAMES) {
                return Some(token);
            }
        }
    }
    None
}

pub(crate) fn find_user(payload: &Value) -> Value {
    for name in ["user", "usuario"] {
        if let Some(found) = get_ci(payload, name).filter(|v| v.is_object()) {
            return found.clone();
        }
    }
    for wrapper in ["data", "objeto", "result"] {
        if let Some(inner) = get_ci(payload, wrapper) {
            for name in ["user", "usuario"] {
                if let Some(found) = get_ci(inner, name).filter(|v| v.is_object()) {
                    return found.clone();
                }
            }
        }
    }
    payload.clone()
}

pub(crate) fn normalize_role(raw: Option<&str>, profile_id: Option<i64>) -> String {
    if let Some(raw) = raw {
        match raw.trim().to_ascii_lowercase().as_str() {
            "superadmin" | "super admin" => return "SuperAdmin".into(),
            "admin" | "administrador" => return "Admin".into(),
            "agente" | "agent" => return "Agente".into(),
            "usuario" | "user" => return "Usuario".into(),
            _ => {}
        }
    }
    match profile_id {
        Some(3) => "SuperAdmin".into(),
        Some(2) => "Admin".into(),
        Some(1) => "Agente".into(),
        _ => "Usuario".into(),
    }
}

// ===== shared record helpers =====

/// The API reports closure under several shapes; any one of them counts.
pub(crate) fn conversation_closed(record: &Value) -> bool {
    if let Some(status) = get_string(record, &["status", "estado"]) {
        if CLOSED_WORDS.contains(&status.trim().to_lowercase().as_str()) {
            return true;
        }
    }
    if get_bool(record, &["isClosed", "cerrada"]) == Some(true) {
        return true;
    }
    if let Some(id) = get_int(record, &["statusId", "estadoId"]) {
        if id >= 2 {
            return true;
        }
    }
    closed_date(record).is_some()
}

fn closed_date(record: &Value) -> Option<DateTime<Utc>> {
    get_date(record, &["endedAt", "ended_at", "closedAt", "closed_at", "fechaCierre"])
}

fn closed_at(record: &Value) -> Option<DateTime<Utc>> {
    closed_date(record).or_else(|| get_date(record, &["lastActivityAt", "last_activity_at"]))
}

pub(crate) fn closed_by_agent_id(record: &Value) -> i64 {
    get_int(
        record,
        &[
            "closedByUserId",
            "closed_by_user_id",
            "agentId",
            "usuarioId",
            "userId",
            "closedById",
        ],
    )
    .unwrap_or(0)
}

pub(crate) fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn parse_date_param(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let value = value.split('T').next().unwrap_or(value);
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

fn parse_range(from: &str, to: &str) -> Option<(NaiveDate, NaiveDate)> {
    let from = parse_date_param(from)?;
    let to = parse_date_param(to)?;
    if from > to {
        return None;
    }
    Some((from, to))
}

/// Inclusive on both bounds, compared at UTC calendar-date granularity.
fn in_range(when: DateTime<Utc>, from: NaiveDate, to: NaiveDate) -> bool {
    let date = when.date_naive();
    date >= from && date <= to
}

pub(crate) fn start_of_iso_week(date: NaiveDate) -> NaiveDate {
    date - ChronoDuration::days(date.weekday().num_days_from_monday() as i64)
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

// ===== dashboard =====

async fn dashboard_page(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let session = match page_session(&state, &headers, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let resolver = resolver_for(&state, &headers);
    let (contacts, conversations, messages) = tokio::join!(
        state.api.fetch_contacts(&resolver),
        state.api.fetch_conversations(&resolver),
        state.api.fetch_messages(&resolver),
    );
    let (contacts, conversations, messages) = match (contacts, conversations, messages) {
        (Ok(c), Ok(v), Ok(m)) => (c, v, m),
        (Err(e), ..) | (_, Err(e), _) | (.., Err(e)) => return api_error_page(&e),
    };

    let contacts: Vec<Contact> = contacts.iter().map(map_contact).collect();
    let messages: Vec<MessageRecord> = messages.iter().map(map_message).collect();
    let view = dashboard_view(&contacts, &conversations, &messages, Utc::now());
    Html(views::render_dashboard(&session.user_name, &view)).into_response()
}

pub(crate) fn dashboard_view(
    contacts: &[Contact],
    conversations: &[Value],
    messages: &[MessageRecord],
    now: DateTime<Utc>,
) -> DashboardView {
    let day_ago = now - ChronoDuration::hours(24);
    let new_clients = contacts
        .iter()
        .filter(|c| c.created_at.map(|d| d > day_ago && d <= now).unwrap_or(false))
        .count();

    // Trailing 12 calendar months ending at the current UTC month.
    let current = now.year() as i64 * 12 + now.month0() as i64;
    let start = current - 11;
    let mut month_labels = Vec::with_capacity(12);
    let mut month_values = vec![0i64; 12];
    for offset in 0..12 {
        let index = start + offset;
        month_labels.push(MONTHS_ES[(index % 12) as usize].to_string());
    }
    for message in messages {
        if let Some(sent) = message.sent_at {
            let index = sent.year() as i64 * 12 + sent.month0() as i64 - start;
            if (0..12).contains(&index) {
                month_values[index as usize] += 1;
            }
        }
    }

    let week_ago = now - ChronoDuration::days(7);
    let mut activity: Vec<ActivityItem> = Vec::new();
    for contact in contacts {
        if let Some(created) = contact.created_at {
            if created > week_ago && created <= now {
                let title = if contact.name.trim().is_empty() {
                    format!("Cliente #{}", contact.id)
                } else {
                    contact.name.clone()
                };
                activity.push(ActivityItem {
                    kind: "contact".into(),
                    title: format!("Nuevo contacto: {title}"),
                    subtitle: contact.phone_number.clone(),
                    when: created,
                });
            }
        }
    }
    let contact_names: HashMap<i64, &str> =
        contacts.iter().map(|c| (c.id, c.name.as_str())).collect();
    for record in conversations {
        if !conversation_closed(record) {
            continue;
        }
        if let Some(when) = closed_at(record) {
            if when > week_ago && when <= now {
                let id = get_int(record, &["id"]).unwrap_or(0);
                let contact_id = get_int(record, &["contactId", "contact_id"]).unwrap_or(0);
                let who = contact_names
                    .get(&contact_id)
                    .filter(|n| !n.trim().is_empty())
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| format!("Cliente #{contact_id}"));
                activity.push(ActivityItem {
                    kind: "closed".into(),
                    title: format!("Conversación #{id} cerrada"),
                    subtitle: who,
                    when,
                });
            }
        }
    }
    activity.sort_by(|a, b| b.when.cmp(&a.when));
    activity.truncate(10);

    DashboardView {
        total_conversations: conversations.len(),
        new_clients,
        // The API exposes no first-response field under any known alias, so
        // the KPI stays at zero rather than being invented.
        avg_first_response_seconds: 0,
        avg_first_response_display: "0s".into(),
        month_labels,
        month_values,
        total_messages: messages.len(),
        activity,
    }
}

// ===== agents =====

async fn agents_page(State(state): State<Arc<AppState>>, headers: HeaderMap, uri: Uri) -> Response {
    let session = match page_session(&state, &headers, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let resolver = resolver_for(&state, &headers);
    let (agents, conversations) = tokio::join!(
        state.api.fetch_agents(&resolver),
        state.api.fetch_conversations(&resolver),
    );
    let (agents, conversations) = match (agents, conversations) {
        (Ok(a), Ok(c)) => (a, c),
        (Err(e), _) | (_, Err(e)) => return api_error_page(&e),
    };
    let view = agents_view(&agents, &conversations, Utc::now());
    Html(views::render_agents(&session.user_name, &view)).into_response()
}

pub(crate) fn agents_view(
    agents: &[UserRecord],
    conversations: &[Value],
    now: DateTime<Utc>,
) -> AgentsView {
    let today = now.date_naive();
    let mut closed_today_by_agent: HashMap<i64, usize> = HashMap::new();
    let mut open = 0usize;
    for record in conversations {
        if conversation_closed(record) {
            if let Some(when) = closed_at(record) {
                if when.date_naive() == today {
                    *closed_today_by_agent
                        .entry(closed_by_agent_id(record))
                        .or_default() += 1;
                }
            }
        } else {
            open += 1;
        }
    }

    let rows: Vec<AgentRow> = agents
        .iter()
        .map(|agent| AgentRow {
            id: agent.id,
            name: agent.name.clone(),
            email: agent.email.clone(),
            is_online: agent.is_online,
            closed_today: closed_today_by_agent.get(&agent.id).copied().unwrap_or(0),
            // Missing last-activity counts as "active now" so the UI never
            // renders a hole.
            minutes_since_activity: agent
                .last_activity
                .map(|at| (now - at).num_minutes().max(0))
                .unwrap_or(0),
            conversation_count: agent.conversation_count,
        })
        .collect();

    let active = agents.iter().filter(|a| a.active.unwrap_or(true)).count();
    let closed_today = rows.iter().map(|r| r.closed_today).sum();
    let avg_load = (open as f64 / active.max(1) as f64 * 10.0).round() / 10.0;
    AgentsView {
        kpi_active: active,
        kpi_open: open,
        kpi_avg_load: avg_load,
        kpi_closed_today: closed_today,
        rows,
    }
}

async fn agents_closed_by_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ClosedByAgentQuery>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    if query.id <= 0 {
        return domain_failure("Parámetros inválidos.");
    }
    let from = query.from.as_deref().and_then(parse_date_param);
    let to = query.to.as_deref().and_then(parse_date_param);

    let resolver = resolver_for(&state, &headers);
    let (conversations, contacts) = tokio::join!(
        state.api.fetch_conversations(&resolver),
        state.api.fetch_contacts(&resolver),
    );
    let (conversations, contacts) = match (conversations, contacts) {
        (Ok(c), Ok(k)) => (c, k),
        (Err(e), _) | (_, Err(e)) => return domain_failure(&e),
    };
    let contacts: Vec<Contact> = contacts.iter().map(map_contact).collect();
    let names: HashMap<i64, &str> = contacts.iter().map(|c| (c.id, c.name.as_str())).collect();

    let items = closed_by_agent_items(&conversations, &names, query.id, from, to);
    Json(json!({ "success": true, "items": items })).into_response()
}

pub(crate) fn closed_by_agent_items(
    conversations: &[Value],
    names: &HashMap<i64, &str>,
    agent_id: i64,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<Value> {
    let mut closed: Vec<(DateTime<Utc>, Value)> = Vec::new();
    for record in conversations {
        if !conversation_closed(record) || closed_by_agent_id(record) != agent_id {
            continue;
        }
        let Some(when) = closed_at(record) else { continue };
        let date = when.date_naive();
        if from.map(|f| date < f).unwrap_or(false) || to.map(|t| date > t).unwrap_or(false) {
            continue;
        }
        let contact_id = get_int(record, &["contactId", "contact_id"]).unwrap_or(0);
        let name = names
            .get(&contact_id)
            .filter(|n| !n.trim().is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("Cliente #{contact_id}"));
        closed.push((
            when,
            json!({
                "conversationId": get_int(record, &["id"]).unwrap_or(0),
                "contactId": contact_id,
                "contactName": name,
                "closedAt": when,
            }),
        ));
    }
    closed.sort_by(|a, b| b.0.cmp(&a.0));
    closed.into_iter().map(|(_, item)| item).collect()
}

async fn agents_update_name(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateNameBody>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    if body.id <= 0 || body.nombre.trim().is_empty() {
        return domain_failure("Parámetros inválidos.");
    }
    let resolver = resolver_for(&state, &headers);
    match state
        .api
        .update_user_name(body.id, body.nombre.trim(), &resolver)
        .await
    {
        Ok(()) => Json(json!({ "success": true, "message": "Actualizado" })).into_response(),
        Err(err) => domain_failure(&err),
    }
}

// ===== contacts =====

async fn contacts_page(State(state): State<Arc<AppState>>, headers: HeaderMap, uri: Uri) -> Response {
    let session = match page_session(&state, &headers, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let resolver = resolver_for(&state, &headers);
    let contacts = match state.api.fetch_contacts(&resolver).await {
        Ok(records) => records.iter().map(map_contact).collect::<Vec<_>>(),
        Err(err) => return api_error_page(&err),
    };
    Html(views::render_contacts(&session.user_name, &contacts)).into_response()
}

async fn contacts_update_name(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateNameBody>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    if body.id <= 0 || body.nombre.trim().is_empty() {
        return domain_failure("Parámetros inválidos.");
    }
    let resolver = resolver_for(&state, &headers);
    match state
        .api
        .update_contact_name(body.id, body.nombre.trim(), &resolver)
        .await
    {
        Ok(()) => Json(json!({ "success": true, "message": "Actualizado" })).into_response(),
        Err(err) => domain_failure(&err),
    }
}

// ===== reports =====

async fn reports_page(State(state): State<Arc<AppState>>, headers: HeaderMap, uri: Uri) -> Response {
    let session = match page_session(&state, &headers, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    Html(views::render_reports(&session.user_name)).into_response()
}

async fn reports_series(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    let Some((from, to)) = parse_range(&query.from, &query.to) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Parámetros inválidos." })),
        )
            .into_response();
    };
    let group_by = query.group_by.as_deref().unwrap_or("day");
    if !matches!(group_by, "day" | "week" | "month") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Parámetros inválidos." })),
        )
            .into_response();
    }

    let resolver = resolver_for(&state, &headers);
    let messages = match state.api.fetch_messages(&resolver).await {
        Ok(records) => records.iter().map(map_message).collect::<Vec<_>>(),
        Err(err) => return domain_failure(&err),
    };
    let (labels, values) = series_buckets(&messages, from, to, group_by);
    Json(json!({ "success": true, "labels": labels, "values": values })).into_response()
}

pub(crate) fn series_buckets(
    messages: &[MessageRecord],
    from: NaiveDate,
    to: NaiveDate,
    group_by: &str,
) -> (Vec<String>, Vec<i64>) {
    let bucket_of = |date: NaiveDate| -> NaiveDate {
        match group_by {
            "week" => start_of_iso_week(date),
            "month" => first_of_month(date),
            _ => date,
        }
    };

    // Zero-filled buckets spanning the whole range.
    let mut keys: Vec<NaiveDate> = Vec::new();
    let mut cursor = bucket_of(from);
    while cursor <= to {
        keys.push(cursor);
        cursor = match group_by {
            "week" => cursor + ChronoDuration::days(7),
            "month" => next_month(cursor),
            _ => cursor + ChronoDuration::days(1),
        };
    }

    let mut counts: HashMap<NaiveDate, i64> = keys.iter().map(|k| (*k, 0)).collect();
    for message in messages {
        let Some(sent) = message.sent_at else { continue };
        if !in_range(sent, from, to) {
            continue;
        }
        if let Some(count) = counts.get_mut(&bucket_of(sent.date_naive())) {
            *count += 1;
        }
    }

    let labels = keys
        .iter()
        .map(|k| match group_by {
            "month" => k.format("%Y-%m").to_string(),
            _ => k.format("%Y-%m-%d").to_string(),
        })
        .collect();
    let values = keys.iter().map(|k| counts[k]).collect();
    (labels, values)
}

async fn reports_agent_closures(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    let Some((from, to)) = parse_range(&query.from, &query.to) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Parámetros inválidos." })),
        )
            .into_response();
    };
    let resolver = resolver_for(&state, &headers);
    let (conversations, agents) = tokio::join!(
        state.api.fetch_conversations(&resolver),
        state.api.fetch_agents(&resolver),
    );
    let (conversations, agents) = match (conversations, agents) {
        (Ok(c), Ok(a)) => (c, a),
        (Err(e), _) | (_, Err(e)) => return domain_failure(&e),
    };
    let items = agent_closures(&conversations, &agents, from, to);
    Json(json!({ "success": true, "items": items })).into_response()
}

pub(crate) fn agent_closures(
    conversations: &[Value],
    agents: &[UserRecord],
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<Value> {
    let mut counts: HashMap<i64, i64> = HashMap::new();
    for record in conversations {
        if !conversation_closed(record) {
            continue;
        }
        let Some(when) = closed_at(record) else { continue };
        if !in_range(when, from, to) {
            continue;
        }
        *counts.entry(closed_by_agent_id(record).max(0)).or_default() += 1;
    }
    let names: HashMap<i64, &str> = agents.iter().map(|a| (a.id, a.name.as_str())).collect();
    let mut items: Vec<(i64, i64)> = counts.into_iter().collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    items
        .into_iter()
        .map(|(agent_id, count)| {
            let name = if agent_id <= 0 {
                "Sin agente".to_string()
            } else {
                names
                    .get(&agent_id)
                    .filter(|n| !n.trim().is_empty())
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| format!("Agente #{agent_id}"))
            };
            json!({ "agentId": agent_id, "agentName": name, "count": count })
        })
        .collect()
}

async fn reports_top_clients(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    let Some((from, to)) = parse_range(&query.from, &query.to) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Parámetros inválidos." })),
        )
            .into_response();
    };
    let limit = query.limit.unwrap_or(10).max(1);

    let resolver = resolver_for(&state, &headers);
    let (messages, contacts) = tokio::join!(
        state.api.fetch_messages(&resolver),
        state.api.fetch_contacts(&resolver),
    );
    let (messages, contacts) = match (messages, contacts) {
        (Ok(m), Ok(c)) => (
            m.iter().map(map_message).collect::<Vec<_>>(),
            c.iter().map(map_contact).collect::<Vec<_>>(),
        ),
        (Err(e), _) | (_, Err(e)) => return domain_failure(&e),
    };
    let items = top_clients(&messages, &contacts, from, to, limit);
    Json(json!({ "success": true, "items": items })).into_response()
}

pub(crate) fn top_clients(
    messages: &[MessageRecord],
    contacts: &[Contact],
    from: NaiveDate,
    to: NaiveDate,
    limit: usize,
) -> Vec<Value> {
    let mut counts: HashMap<i64, i64> = HashMap::new();
    for message in messages {
        let Some(sent) = message.sent_at else { continue };
        if message.contact_id > 0 && in_range(sent, from, to) {
            *counts.entry(message.contact_id).or_default() += 1;
        }
    }
    let names: HashMap<i64, &str> = contacts.iter().map(|c| (c.id, c.name.as_str())).collect();
    let mut items: Vec<(i64, i64)> = counts.into_iter().collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    items
        .into_iter()
        .take(limit)
        .map(|(contact_id, count)| {
            let name = names
                .get(&contact_id)
                .filter(|n| !n.trim().is_empty())
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("Cliente #{contact_id}"));
            json!({ "contactId": contact_id, "contactName": name, "count": count })
        })
        .collect()
}

async fn reports_kpis(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    let Some((from, to)) = parse_range(&query.from, &query.to) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Parámetros inválidos." })),
        )
            .into_response();
    };
    let resolver = resolver_for(&state, &headers);
    let (messages, conversations) = tokio::join!(
        state.api.fetch_messages(&resolver),
        state.api.fetch_conversations(&resolver),
    );
    let (messages, conversations) = match (messages, conversations) {
        (Ok(m), Ok(c)) => (m.iter().map(map_message).collect::<Vec<_>>(), c),
        (Err(e), _) | (_, Err(e)) => return domain_failure(&e),
    };

    let total_messages = messages
        .iter()
        .filter(|m| m.sent_at.map(|s| in_range(s, from, to)).unwrap_or(false))
        .count();
    let closures = conversations
        .iter()
        .filter(|record| {
            conversation_closed(record)
                && closed_at(record).map(|w| in_range(w, from, to)).unwrap_or(false)
        })
        .count();
    let new_clients = new_clients_in_range(&messages, from, to);
    Json(json!({
        "success": true,
        "totalMessages": total_messages,
        "agentClosures": closures,
        "newClients": new_clients,
    }))
    .into_response()
}

/// A client is "new" in a range when its first message ever falls inside it.
pub(crate) fn new_clients_in_range(
    messages: &[MessageRecord],
    from: NaiveDate,
    to: NaiveDate,
) -> usize {
    let mut first_seen: HashMap<i64, DateTime<Utc>> = HashMap::new();
    for message in messages {
        let Some(sent) = message.sent_at else { continue };
        if message.contact_id <= 0 {
            continue;
        }
        first_seen
            .entry(message.contact_id)
            .and_modify(|at| {
                if sent < *at {
                    *at = sent;
                }
            })
            .or_insert(sent);
    }
    first_seen
        .values()
        .filter(|at| in_range(**at, from, to))
        .count()
}

// ===== chat =====

async fn chat_page(State(state): State<Arc<AppState>>, headers: HeaderMap, uri: Uri) -> Response {
    let session = match page_session(&state, &headers, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    Html(views::render_chat(&session.user_name)).into_response()
}

fn sort_key(conv: &Conversation) -> DateTime<Utc> {
    conv.last_activity_at
        .or(conv.started_at)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn chat_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PhoneQuery>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    let wanted = digits_only(&query.phone);
    if wanted.is_empty() {
        return domain_failure("Parámetros inválidos.");
    }
    let resolver = resolver_for(&state, &headers);
    let (contacts, conversations) = tokio::join!(
        state.api.fetch_contacts(&resolver),
        state.api.fetch_conversations(&resolver),
    );
    let (contacts, conversations) = match (contacts, conversations) {
        (Ok(c), Ok(v)) => (c.iter().map(map_contact).collect::<Vec<_>>(), v),
        (Err(e), _) | (_, Err(e)) => return domain_failure(&e),
    };
    let Some(contact) = contacts
        .iter()
        .find(|c| digits_only(&c.phone_number) == wanted)
    else {
        return domain_failure("Contacto no encontrado.");
    };

    let mut items: Vec<Conversation> = conversations
        .iter()
        .map(map_conversation)
        .filter(|c| c.contact_id == contact.id)
        .collect();
    items.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
    Json(json!({ "success": true, "contact": contact, "items": items })).into_response()
}

async fn chat_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ConversationQuery>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    if query.conversation_id <= 0 {
        return domain_failure("Parámetros inválidos.");
    }
    let resolver = resolver_for(&state, &headers);
    let mut items: Vec<MessageRecord> = match state.api.fetch_messages(&resolver).await {
        Ok(records) => records
            .iter()
            .map(map_message)
            .filter(|m| m.conversation_id == query.conversation_id)
            .collect(),
        Err(err) => return domain_failure(&err),
    };
    items.sort_by_key(|m| m.sent_at.unwrap_or(DateTime::<Utc>::MIN_UTC));
    Json(json!({ "success": true, "items": items })).into_response()
}

async fn chat_all_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    let resolver = resolver_for(&state, &headers);
    let (conversations, contacts) = tokio::join!(
        state.api.fetch_conversations(&resolver),
        state.api.fetch_contacts(&resolver),
    );
    let (conversations, contacts) = match (conversations, contacts) {
        (Ok(v), Ok(c)) => (v, c.iter().map(map_contact).collect::<Vec<_>>()),
        (Err(e), _) | (_, Err(e)) => return domain_failure(&e),
    };
    let by_id: HashMap<i64, &Contact> = contacts.iter().map(|c| (c.id, c)).collect();

    // Only conversations that actually asked for an agent belong in the
    // relay queue.
    let mut typed: Vec<Conversation> = conversations
        .iter()
        .map(map_conversation)
        .filter(|c| c.agent_requested_at.is_some())
        .collect();
    typed.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));

    let items: Vec<Value> = typed
        .into_iter()
        .map(|conv| {
            let contact = by_id.get(&conv.contact_id);
            let name = contact
                .map(|c| c.name.clone())
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("Cliente #{}", conv.contact_id));
            let phone = contact.map(|c| c.phone_number.clone()).unwrap_or_default();
            let mut value = serde_json::to_value(&conv).unwrap_or(Value::Null);
            if let Some(map) = value.as_object_mut() {
                map.insert("contactName".into(), json!(name));
                map.insert("contactPhone".into(), json!(phone));
                map.insert("closed".into(), json!(!conv.status.eq_ignore_ascii_case("open")));
            }
            value
        })
        .collect();
    Json(json!({ "success": true, "items": items })).into_response()
}

/// Outcome of the best-effort closing notification. A failed notify never
/// fails the close itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NotifyOutcome {
    Sent,
    Skipped,
    Failed(String),
}

pub(crate) async fn send_message(
    api: &dyn RemoteApi,
    body: &SendMessageBody,
) -> Result<SendResult, String> {
    let text = body.message.trim();
    if text.is_empty() || body.contact_id <= 0 {
        return Err("Parámetros inválidos.".into());
    }

    // Status must be re-fetched, never trusted from the client. A
    // conversation that cannot be found has no verifiable "open" status and
    // is rejected the same way a closed one is.
    let conversations = api.conversations().await?;
    let open = conversations
        .iter()
        .find(|r| get_int(r, &["id"]) == Some(body.conversation_id))
        .map(|record| !conversation_closed(record))
        .unwrap_or(false);
    if !open {
        return Err("La conversación está cerrada. No se puede enviar.".into());
    }

    let phone = match body.contact_phone.as_deref().map(str::trim) {
        Some(phone) if !phone.is_empty() => phone.to_string(),
        _ => {
            let contacts = api.contacts().await?;
            contacts
                .iter()
                .map(map_contact)
                .find(|c| c.id == body.contact_id)
                .map(|c| c.phone_number)
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| "No se pudo resolver el teléfono del contacto".to_string())?
        }
    };

    let payload = json!({
        "Contact_Id": body.contact_id,
        "Conversation_Id": body.conversation_id,
        "To_Phone": phone,
        "Text": text,
        "Create_If_Not_Exists": false,
        "Log": true,
    });
    api.send_text(payload).await
}

pub(crate) async fn close_conversation(
    api: &dyn RemoteApi,
    scheduler: &AutoCloseScheduler,
    body: &UpdateStatusBody,
    now: DateTime<Utc>,
) -> Result<NotifyOutcome, String> {
    // Any requested status other than "open" means closing; only reopening
    // is forbidden.
    let requested = body.status.trim().to_lowercase();
    if requested == "open" || requested == "abierta" {
        return Err("No se permite reabrir conversaciones cerradas.".into());
    }
    if body.conversation_id <= 0 {
        return Err("Parámetros inválidos.".into());
    }

    let conversations = api.conversations().await?;
    let Some(record) = conversations
        .iter()
        .find(|r| get_int(r, &["id"]) == Some(body.conversation_id))
    else {
        return Err("Conversación no encontrada.".into());
    };
    if conversation_closed(record) {
        return Err("La conversación ya está cerrada.".into());
    }

    let contact_id = get_int(record, &["contactId", "contact_id"])
        .or(body.contact_id)
        .unwrap_or(0);
    let started = get_date(record, &["startedAt", "started_at"])
        .or(body.started_at)
        .unwrap_or(now);
    let upsert = json!({
        "Id": body.conversation_id,
        "Contact_Id": contact_id,
        "Started_At": started,
        "Status": "closed",
        "Last_Activity_At": now,
    });
    // The upsert is the close itself; if it fails nothing else runs.
    api.upsert_conversation(upsert).await?;

    let outcome = notify_closed(api, body.conversation_id, contact_id).await;
    if let NotifyOutcome::Failed(err) = &outcome {
        tracing::warn!(conversation_id = body.conversation_id, error = %err, "closing notification failed");
    }

    scheduler.cancel(body.conversation_id).await;
    Ok(outcome)
}

async fn notify_closed(api: &dyn RemoteApi, conversation_id: i64, contact_id: i64) -> NotifyOutcome {
    if contact_id <= 0 {
        return NotifyOutcome::Skipped;
    }
    let contacts = match api.contacts().await {
        Ok(contacts) => contacts,
        Err(err) => return NotifyOutcome::Failed(err),
    };
    let Some(phone) = contacts
        .iter()
        .map(map_contact)
        .find(|c| c.id == contact_id)
        .map(|c| c.phone_number)
        .filter(|p| !p.trim().is_empty())
    else {
        return NotifyOutcome::Skipped;
    };
    let payload = json!({
        "Contact_Id": contact_id,
        "Conversation_Id": conversation_id,
        "To_Phone": phone,
        "Text": CLOSING_NOTICE,
        "Create_If_Not_Exists": false,
        "Log": true,
    });
    match api.send_text(payload).await {
        Ok(_) => NotifyOutcome::Sent,
        Err(err) => NotifyOutcome::Failed(err),
    }
}

/// `RemoteApi` with owned state, for futures that outlive the request.
struct OwnedApi {
    state: Arc<AppState>,
    resolver: AuthResolver,
}

#[async_trait]
impl RemoteApi for OwnedApi {
    async fn conversations(&self) -> Result<Vec<Value>, String> {
        self.state.api.fetch_conversations(&self.resolver).await
    }

    async fn contacts(&self) -> Result<Vec<Value>, String> {
        self.state.api.fetch_contacts(&self.resolver).await
    }

    async fn send_text(&self, payload: Value) -> Result<SendResult, String> {
        self.state.api.send_text(&payload, &self.resolver).await
    }

    async fn upsert_conversation(&self, payload: Value) -> Result<(), String> {
        self.state
            .api
            .upsert_conversation(&payload, &self.resolver)
            .await
    }
}

/// Every successful relay send re-arms the idle close timer.
async fn arm_auto_close(state: &Arc<AppState>, resolver: &AuthResolver, conversation_id: i64) {
    let action = {
        let state = Arc::clone(state);
        let resolver = resolver.clone();
        async move {
            tracing::info!(conversation_id, "auto-close timer fired");
            let scheduler = Arc::clone(&state.auto_close);
            let api = OwnedApi {
                state: Arc::clone(&state),
                resolver,
            };
            let body = UpdateStatusBody {
                conversation_id,
                status: "closed".into(),
                contact_id: None,
                started_at: None,
            };
            if let Err(err) = close_conversation(&api, &scheduler, &body, Utc::now()).await {
                tracing::warn!(conversation_id, error = %err, "auto-close failed");
            }
        }
    };
    state
        .auto_close
        .schedule(conversation_id, AUTO_CLOSE_AFTER, action)
        .await;
}

async fn chat_send(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    let resolver = resolver_for(&state, &headers);
    let bound = crate::api::BoundApi {
        client: &state.api,
        resolver: &resolver,
    };
    match send_message(&bound, &body).await {
        Ok(result) => {
            let conversation_id = result.conversation_id.unwrap_or(body.conversation_id);
            if conversation_id > 0 {
                arm_auto_close(&state, &resolver, conversation_id).await;
            }
            Json(json!({
                "success": true,
                "conversationId": conversation_id,
                "justCreated": result.just_created,
            }))
            .into_response()
        }
        Err(err) => domain_failure(&err),
    }
}

async fn chat_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateStatusBody>,
) -> Response {
    if let Err(response) = json_session(&state, &headers).await {
        return response;
    }
    let resolver = resolver_for(&state, &headers);
    let bound = crate::api::BoundApi {
        client: &state.api,
        resolver: &resolver,
    };
    match close_conversation(&bound, &state.auto_close, &body, Utc::now()).await {
        Ok(outcome) => Json(json!({
            "success": true,
            "message": "La conversación ha sido cerrada.",
            "notified": outcome == NotifyOutcome::Sent,
        }))
        .into_response(),
        Err(err) => domain_failure(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::Mutex;

    struct MockApi {
        calls: Mutex<Vec<&'static str>>,
        conversations: Vec<Value>,
        contacts: Vec<Value>,
        send_error: Option<String>,
        upsert_error: Option<String>,
        send_payloads: Mutex<Vec<Value>>,
        upsert_payloads: Mutex<Vec<Value>>,
    }

    impl MockApi {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                conversations: Vec::new(),
                contacts: Vec::new(),
                send_error: None,
                upsert_error: None,
                send_payloads: Mutex::new(Vec::new()),
                upsert_payloads: Mutex::new(Vec::new()),
            }
        }

        async fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl RemoteApi for MockApi {
        async fn conversations(&self) -> Result<Vec<Value>, String> {
            self.calls.lock().await.push("conversations");
            Ok(self.conversations.clone())
        }

        async fn contacts(&self) -> Result<Vec<Value>, String> {
            self.calls.lock().await.push("contacts");
            Ok(self.contacts.clone())
        }

        async fn send_text(&self, payload: Value) -> Result<SendResult, String> {
            self.calls.lock().await.push("send");
            self.send_payloads.lock().await.push(payload);
            match &self.send_error {
                Some(err) => Err(err.clone()),
                None => Ok(SendResult {
                    conversation_id: Some(7),
                    just_created: false,
                }),
            }
        }

        async fn upsert_conversation(&self, payload: Value) -> Result<(), String> {
            self.calls.lock().await.push("upsert");
            self.upsert_payloads.lock().await.push(payload);
            match &self.upsert_error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn open_conversation(id: i64, contact_id: i64) -> Value {
        json!({
            "id": id,
            "contactId": contact_id,
            "status": "open",
            "startedAt": "2024-03-01T10:00:00Z",
        })
    }

    fn send_body(conversation_id: i64) -> SendMessageBody {
        SendMessageBody {
            conversation_id,
            contact_id: 2,
            contact_phone: Some("50688887777".into()),
            message: "hola".into(),
        }
    }

    fn close_body(conversation_id: i64) -> UpdateStatusBody {
        UpdateStatusBody {
            conversation_id,
            status: "closed".into(),
            contact_id: None,
            started_at: None,
        }
    }

    #[tokio::test]
    async fn send_to_closed_conversation_is_rejected_without_forwarding() {
        let mut api = MockApi::new();
        api.conversations = vec![json!({ "id": 7, "contactId": 2, "status": "cerrada" })];
        let err = send_message(&api, &send_body(7)).await.unwrap_err();
        assert!(err.contains("cerrada"));
        assert_eq!(api.calls().await, vec!["conversations"]);
    }

    #[tokio::test]
    async fn send_to_open_conversation_is_forwarded() {
        let mut api = MockApi::new();
        api.conversations = vec![open_conversation(7, 2)];
        let result = send_message(&api, &send_body(7)).await.unwrap();
        assert_eq!(result.conversation_id, Some(7));
        assert_eq!(api.calls().await, vec!["conversations", "send"]);
        // the relay never creates conversations on the API's behalf
        let payload = api.send_payloads.lock().await[0].clone();
        assert_eq!(payload["Create_If_Not_Exists"], json!(false));
    }

    #[tokio::test]
    async fn send_to_unknown_conversation_is_rejected_without_forwarding() {
        let api = MockApi::new();
        let err = send_message(&api, &send_body(7)).await.unwrap_err();
        assert!(err.contains("cerrada"));
        assert_eq!(api.calls().await, vec!["conversations"]);

        let mut api = MockApi::new();
        api.conversations = vec![open_conversation(8, 2)];
        let err = send_message(&api, &send_body(7)).await.unwrap_err();
        assert!(err.contains("cerrada"));
        assert!(!api.calls().await.contains(&"send"));
    }

    #[tokio::test]
    async fn send_resolves_phone_from_contact_list() {
        let mut api = MockApi::new();
        api.conversations = vec![open_conversation(7, 2)];
        api.contacts = vec![json!({ "id": 2, "phoneNumber": "+506 8888-7777" })];
        let mut body = send_body(7);
        body.contact_phone = None;
        assert!(send_message(&api, &body).await.is_ok());
        assert_eq!(api.calls().await, vec!["conversations", "contacts", "send"]);
    }

    #[tokio::test]
    async fn send_fails_when_phone_cannot_be_resolved() {
        let mut api = MockApi::new();
        api.conversations = vec![open_conversation(7, 2)];
        let mut body = send_body(7);
        body.contact_phone = None;
        let err = send_message(&api, &body).await.unwrap_err();
        assert!(err.contains("teléfono"));
        assert!(!api.calls().await.contains(&"send"));
    }

    #[tokio::test]
    async fn reopen_is_always_rejected() {
        let mut api = MockApi::new();
        api.conversations = vec![json!({ "id": 7, "status": "cerrada" })];
        let scheduler = AutoCloseScheduler::default();
        let mut body = close_body(7);
        body.status = "open".into();
        let err = close_conversation(&api, &scheduler, &body, Utc::now())
            .await
            .unwrap_err();
        assert!(err.contains("reabrir"));
        assert!(api.calls().await.is_empty());
    }

    #[tokio::test]
    async fn already_closed_and_not_found_have_distinct_reasons() {
        let mut api = MockApi::new();
        api.conversations = vec![json!({ "id": 7, "contactId": 2, "status": "cerrada" })];
        let scheduler = AutoCloseScheduler::default();
        let already = close_conversation(&api, &scheduler, &close_body(7), Utc::now())
            .await
            .unwrap_err();
        let missing = close_conversation(&api, &scheduler, &close_body(99), Utc::now())
            .await
            .unwrap_err();
        assert!(already.contains("ya está cerrada"));
        assert!(missing.contains("no encontrada"));
        assert_ne!(already, missing);
    }

    #[tokio::test]
    async fn close_runs_upsert_then_notify_and_survives_notify_failure() {
        let mut api = MockApi::new();
        api.conversations = vec![open_conversation(7, 2)];
        api.contacts = vec![json!({ "id": 2, "phoneNumber": "50688887777" })];
        api.send_error = Some("boom".into());
        let scheduler = AutoCloseScheduler::default();
        let outcome = close_conversation(&api, &scheduler, &close_body(7), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Failed("boom".into()));
        let calls = api.calls().await;
        let upsert_at = calls.iter().position(|c| *c == "upsert").unwrap();
        let send_at = calls.iter().position(|c| *c == "send").unwrap();
        assert!(upsert_at < send_at);
    }

    #[tokio::test]
    async fn close_fails_when_upsert_fails_and_skips_notify() {
        let mut api = MockApi::new();
        api.conversations = vec![open_conversation(7, 2)];
        api.upsert_error = Some("offline".into());
        let scheduler = AutoCloseScheduler::default();
        let err = close_conversation(&api, &scheduler, &close_body(7), Utc::now())
            .await
            .unwrap_err();
        assert!(err.contains("offline"));
        assert!(!api.calls().await.contains(&"send"));
    }

    #[tokio::test]
    async fn close_accepts_free_form_status_and_writes_closed() {
        let mut api = MockApi::new();
        api.conversations = vec![open_conversation(7, 2)];
        let scheduler = AutoCloseScheduler::default();
        let mut body = close_body(7);
        body.status = "resolved".into();
        let outcome = close_conversation(&api, &scheduler, &body, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Skipped);
        // whatever the caller says, the stored status is "closed"
        let payload = api.upsert_payloads.lock().await[0].clone();
        assert_eq!(payload["Status"], json!("closed"));
    }

    #[tokio::test]
    async fn close_without_phone_skips_notification() {
        let mut api = MockApi::new();
        api.conversations = vec![open_conversation(7, 2)];
        let scheduler = AutoCloseScheduler::default();
        let outcome = close_conversation(&api, &scheduler, &close_body(7), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Skipped);
    }

    #[test]
    fn histogram_emits_twelve_chronological_buckets_with_zero_months() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let messages = vec![
            MessageRecord {
                id: 1,
                conversation_id: 1,
                contact_id: 1,
                agent_id: None,
                sender: "contact".into(),
                body: "a".into(),
                kind: "text".into(),
                media_path: String::new(),
                sent_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            },
            MessageRecord {
                id: 2,
                conversation_id: 1,
                contact_id: 1,
                agent_id: None,
                sender: "contact".into(),
                body: "b".into(),
                kind: "text".into(),
                media_path: String::new(),
                sent_at: Some(Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap()),
            },
            // Outside the trailing window, must be ignored.
            MessageRecord {
                id: 3,
                conversation_id: 1,
                contact_id: 1,
                agent_id: None,
                sender: "contact".into(),
                body: "c".into(),
                kind: "text".into(),
                media_path: String::new(),
                sent_at: Some(Utc.with_ymd_and_hms(2022, 12, 1, 0, 0, 0).unwrap()),
            },
        ];
        let view = dashboard_view(&[], &[], &messages, now);
        assert_eq!(view.month_labels.len(), 12);
        assert_eq!(view.month_values.len(), 12);
        assert_eq!(view.month_labels.first().map(String::as_str), Some("abr"));
        assert_eq!(view.month_labels.last().map(String::as_str), Some("mar"));
        assert_eq!(view.month_values[0], 1);
        assert_eq!(view.month_values[11], 1);
        assert_eq!(view.month_values.iter().sum::<i64>(), 2);
    }

    #[test]
    fn first_response_kpi_stays_at_zero() {
        let view = dashboard_view(&[], &[], &[], Utc::now());
        assert_eq!(view.avg_first_response_seconds, 0);
        assert_eq!(view.avg_first_response_display, "0s");
    }

    #[test]
    fn single_day_range_is_inclusive_on_both_bounds() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let inside = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap();
        let before = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert!(in_range(inside, day, day));
        assert!(!in_range(before, day, day));
        assert!(!in_range(after, day, day));
    }

    #[test]
    fn series_buckets_zero_fill_the_range() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let message = MessageRecord {
            id: 1,
            conversation_id: 1,
            contact_id: 1,
            agent_id: None,
            sender: "contact".into(),
            body: "a".into(),
            kind: "text".into(),
            media_path: String::new(),
            sent_at: Some(Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap()),
        };
        let (labels, values) = series_buckets(&[message], from, to, "day");
        assert_eq!(labels, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
        assert_eq!(values, vec![0, 1, 0]);
    }

    #[test]
    fn iso_week_starts_on_monday() {
        // 2024-01-03 is a Wednesday.
        let wednesday = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        assert_eq!(
            start_of_iso_week(wednesday),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(start_of_iso_week(monday), monday);
    }

    #[test]
    fn agent_closures_group_unassigned_under_sin_agente() {
        let conversations = vec![
            json!({ "id": 1, "status": "closed", "endedAt": "2024-01-02T10:00:00Z", "closedByUserId": 5 }),
            json!({ "id": 2, "status": "closed", "endedAt": "2024-01-02T11:00:00Z" }),
        ];
        let agents = vec![UserRecord {
            id: 5,
            name: "Marta".into(),
            email: String::new(),
            phone: String::new(),
            active: Some(true),
            profile_id: Some(1),
            company: String::new(),
            tenant_id: None,
            last_login: None,
            last_activity: None,
            is_online: false,
            conversation_count: 0,
        }];
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let items = agent_closures(&conversations, &agents, from, to);
        assert_eq!(items.len(), 2);
        let names: Vec<&str> = items.iter().filter_map(|i| i["agentName"].as_str()).collect();
        assert!(names.contains(&"Marta"));
        assert!(names.contains(&"Sin agente"));
    }

    #[test]
    fn closed_by_agent_items_sort_by_instant_not_by_string() {
        // fractional-second timestamps order wrongly under string comparison
        let conversations = vec![
            json!({ "id": 1, "contactId": 2, "status": "closed", "closedByUserId": 5,
                    "endedAt": "2024-01-02T10:00:01Z" }),
            json!({ "id": 2, "contactId": 2, "status": "closed", "closedByUserId": 5,
                    "endedAt": "2024-01-02T10:00:01.500Z" }),
        ];
        let names: HashMap<i64, &str> = HashMap::new();
        let items = closed_by_agent_items(&conversations, &names, 5, None, None);
        let ids: Vec<i64> = items
            .iter()
            .map(|i| i["conversationId"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn new_clients_counted_by_first_message_only() {
        let old = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let mk = |id, contact_id, sent_at| MessageRecord {
            id,
            conversation_id: 1,
            contact_id,
            agent_id: None,
            sender: "contact".into(),
            body: "x".into(),
            kind: "text".into(),
            media_path: String::new(),
            sent_at: Some(sent_at),
        };
        // Contact 1 first wrote before the range; contact 2 inside it.
        let messages = vec![mk(1, 1, old), mk(2, 1, recent), mk(3, 2, recent)];
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(new_clients_in_range(&messages, from, to), 1);
    }

    #[test]
    fn conversation_closed_detects_all_shapes() {
        assert!(conversation_closed(&json!({ "status": "Cerrada" })));
        assert!(conversation_closed(&json!({ "isClosed": true })));
        assert!(conversation_closed(&json!({ "statusId": 2 })));
        assert!(conversation_closed(&json!({ "endedAt": "2024-01-01T00:00:00Z" })));
        assert!(!conversation_closed(&json!({ "status": "open", "statusId": 1 })));
    }

    #[test]
    fn role_normalization_prefers_name_then_profile_id() {
        assert_eq!(normalize_role(Some("ADMIN"), None), "Admin");
        assert_eq!(normalize_role(Some("agente"), Some(3)), "Agente");
        assert_eq!(normalize_role(None, Some(3)), "SuperAdmin");
        assert_eq!(normalize_role(None, Some(2)), "Admin");
        assert_eq!(normalize_role(None, Some(1)), "Agente");
        assert_eq!(normalize_role(Some("gerente"), None), "Usuario");
    }

    #[test]
    fn find_token_handles_nested_shapes() {
        assert_eq!(
            find_token(&json!({ "Token": "abc" })).as_deref(),
            Some("abc")
        );
        assert_eq!(
            find_token(&json!({ "data": { "token": "abc" } })).as_deref(),
            Some("abc")
        );
        assert_eq!(
            find_token(&json!({ "resultado": { "jwt": "abc" } })).as_deref(),
            Some("abc")
        );
        assert!(find_token(&json!({ "ok": true })).is_none());
    }

    #[test]
    fn find_user_prefers_wrapped_user_object() {
        let payload = json!({ "data": { "usuario": { "id": 9, "nombre": "Ana" } }, "token": "t" });
        let user = find_user(&payload);
        assert_eq!(get_int(&user, &["id"]), Some(9));
        // With no user object anywhere the root doubles as the record.
        let flat = json!({ "id": 4, "nombre": "Luis", "token": "t" });
        assert_eq!(get_int(&find_user(&flat), &["id"]), Some(4));
    }

    #[test]
    fn phone_matching_ignores_formatting() {
        assert_eq!(digits_only("+506 8888-7777"), "50688887777");
        assert_eq!(digits_only("(506)8888.7777"), "50688887777");
        assert_eq!(digits_only("sin número"), "");
    }

    #[test]
    fn agents_view_defaults_missing_activity_to_zero_minutes() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let agents = vec![
            UserRecord {
                id: 1,
                name: "A".into(),
                email: String::new(),
                phone: String::new(),
                active: Some(true),
                profile_id: Some(1),
                company: String::new(),
                tenant_id: None,
                last_login: None,
                last_activity: Some(now - ChronoDuration::minutes(42)),
                is_online: true,
                conversation_count: 3,
            },
            UserRecord {
                id: 2,
                name: "B".into(),
                email: String::new(),
                phone: String::new(),
                active: Some(true),
                profile_id: Some(1),
                company: String::new(),
                tenant_id: None,
                last_login: None,
                last_activity: None,
                is_online: false,
                conversation_count: 0,
            },
        ];
        let conversations = vec![
            json!({ "id": 1, "status": "open" }),
            json!({ "id": 2, "status": "closed", "endedAt": now, "closedByUserId": 1 }),
        ];
        let view = agents_view(&agents, &conversations, now);
        assert_eq!(view.rows[0].minutes_since_activity, 42);
        assert_eq!(view.rows[1].minutes_since_activity, 0);
        assert_eq!(view.rows[0].closed_today, 1);
        assert_eq!(view.kpi_open, 1);
        assert_eq!(view.kpi_closed_today, 1);
    }
}
