use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{api::ApiClient, auth::SessionStore, autoclose::AutoCloseScheduler};

/// View-side projection of an upstream contact record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub phone_number: String,
    pub country: String,
    pub ip_address: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub profile_pic: String,
    pub status: String,
    pub welcome_sent: bool,
}

/// View-side projection of a conversation session owned by the remote API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub contact_id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub greeting_sent: bool,
    pub status: String,
    pub ended_at: Option<DateTime<Utc>>,
    pub closed_by_user_id: Option<i64>,
    pub agent_requested_at: Option<DateTime<Utc>>,
    pub total_messages: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: i64,
    pub contact_id: i64,
    pub agent_id: Option<i64>,
    pub sender: String,
    pub body: String,
    pub kind: String,
    pub media_path: String,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Upstream user/agent record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub active: Option<bool>,
    pub profile_id: Option<i64>,
    pub company: String,
    pub tenant_id: Option<i64>,
    pub last_login: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub conversation_count: i64,
}

// ===== dashboard =====

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityItem {
    pub kind: String,
    pub title: String,
    pub subtitle: String,
    pub when: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub total_conversations: usize,
    pub new_clients: usize,
    pub avg_first_response_seconds: i64,
    pub avg_first_response_display: String,
    pub month_labels: Vec<String>,
    pub month_values: Vec<i64>,
    pub total_messages: usize,
    pub activity: Vec<ActivityItem>,
}

// ===== agents =====

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRow {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub is_online: bool,
    pub closed_today: usize,
    pub minutes_since_activity: i64,
    pub conversation_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsView {
    pub kpi_active: usize,
    pub kpi_open: usize,
    pub kpi_avg_load: f64,
    pub kpi_closed_today: usize,
    pub rows: Vec<AgentRow>,
}

// ===== request bodies / queries =====

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub return_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ReturnUrlQuery {
    #[serde(default, rename = "returnUrl")]
    pub return_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNameBody {
    pub id: i64,
    pub nombre: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneQuery {
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    #[serde(default)]
    pub conversation_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedByAgentQuery {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub conversation_id: i64,
    #[serde(default)]
    pub contact_id: i64,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusBody {
    #[serde(default)]
    pub conversation_id: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub contact_id: Option<i64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

// ===== app state =====

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub tenant_id_fallback: String,
    pub port: u16,
}

pub struct AppState {
    pub config: Config,
    pub api: ApiClient,
    pub sessions: Arc<SessionStore>,
    pub auto_close: Arc<AutoCloseScheduler>,
}
