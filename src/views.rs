use minijinja::{context, Environment};

use crate::types::{AgentsView, Contact, DashboardView};

const LOGIN_TEMPLATE: &str = include_str!("templates/login.j2");
const DASHBOARD_TEMPLATE: &str = include_str!("templates/dashboard.j2");
const AGENTS_TEMPLATE: &str = include_str!("templates/agents.j2");
const CONTACTS_TEMPLATE: &str = include_str!("templates/contacts.j2");
const REPORTS_TEMPLATE: &str = include_str!("templates/reports.j2");
const CHAT_TEMPLATE: &str = include_str!("templates/chat.j2");

fn render(name: &str, source: &str, ctx: minijinja::Value, fallback: String) -> String {
    let mut env = Environment::new();
    if env.add_template(name, source).is_err() {
        return fallback;
    }
    let Ok(template) = env.get_template(name) else {
        return fallback;
    };
    template.render(ctx).unwrap_or(fallback)
}

pub fn render_login(error: Option<&str>, return_url: &str) -> String {
    render(
        "login",
        LOGIN_TEMPLATE,
        context! {
            error => error,
            return_url => return_url,
        },
        format!(
            "<h1>Iniciar sesión</h1><p>{}</p>",
            error.unwrap_or("Formulario no disponible.")
        ),
    )
}

pub fn render_dashboard(user_name: &str, view: &DashboardView) -> String {
    render(
        "dashboard",
        DASHBOARD_TEMPLATE,
        context! {
            user_name => user_name,
            view => view,
        },
        format!(
            "<h1>Dashboard</h1><p>Conversaciones: {} · Mensajes: {}</p>",
            view.total_conversations, view.total_messages
        ),
    )
}

pub fn render_agents(user_name: &str, view: &AgentsView) -> String {
    render(
        "agents",
        AGENTS_TEMPLATE,
        context! {
            user_name => user_name,
            view => view,
        },
        format!("<h1>Agentes</h1><p>{} agentes activos</p>", view.kpi_active),
    )
}

pub fn render_contacts(user_name: &str, contacts: &[Contact]) -> String {
    render(
        "contacts",
        CONTACTS_TEMPLATE,
        context! {
            user_name => user_name,
            contacts => contacts,
        },
        format!("<h1>Contactos</h1><p>{} contactos</p>", contacts.len()),
    )
}

pub fn render_reports(user_name: &str) -> String {
    render(
        "reports",
        REPORTS_TEMPLATE,
        context! { user_name => user_name },
        "<h1>Reportes</h1>".to_string(),
    )
}

pub fn render_chat(user_name: &str) -> String {
    render(
        "chat",
        CHAT_TEMPLATE,
        context! { user_name => user_name },
        "<h1>Chat</h1>".to_string(),
    )
}
