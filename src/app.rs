use std::error::Error;
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use handlebars::Handlebars;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::downloader;
use crate::error::{Result, TombolaError};
use crate::loader::{ImportOptions, read_orders};
use crate::login::{self, Operator, SessionStore};
use crate::mailer::{self, Notifier, Recipients, SmtpMailer};
use crate::order::{Order, OrderKey};
use crate::store::OrderStore;
use crate::tickets::{expand, ticket_label, ticket_ranges, total_tickets};

const UPLOAD_LIMIT: usize = 10 * 1024 * 1024;
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Everything a request handler may touch. Passed explicitly to every handler.
pub struct AppState {
    pub store: OrderStore,
    pub sessions: SessionStore,
    pub operator: Option<Operator>,
    notifier: Option<(Arc<dyn Notifier>, Recipients)>,
    article: String,
    min_date: Option<NaiveDate>,
    templates: Handlebars<'static>,
}

impl AppState {
    pub fn new(store: OrderStore, article: &str, min_date: Option<NaiveDate>) -> Result<Self> {
        let mut templates = Handlebars::new();
        for (name, source) in [
            ("login", include_str!("./static/login.hbs")),
            ("orders", include_str!("./static/orders.hbs")),
        ] {
            templates
                .register_template_string(name, source)
                .map_err(|e| TombolaError::Template(e.to_string()))?;
        }

        Ok(AppState {
            store,
            sessions: SessionStore::default(),
            operator: None,
            notifier: None,
            article: article.to_string(),
            min_date,
            templates,
        })
    }

    pub fn with_operator(mut self, operator: Operator) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, recipients: Recipients) -> Self {
        self.notifier = Some((notifier, recipients));
        self
    }

    /// Connect and migrate the database, then wire optional login and mail.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = OrderStore::connect(&config.database_url).await?;
        store.migrate().await?;

        let mut state = AppState::new(store, &config.article, config.min_date)?;
        match &config.operator {
            Some(operator) => state = state.with_operator(Operator::from_config(operator)?),
            None => warn!("OPERATOR_USER is not set: the ticket office is open without login"),
        }
        match &config.smtp {
            Some(smtp) => {
                let mailer = SmtpMailer::new(smtp)?;
                state = state.with_notifier(Arc::new(mailer), Recipients::from(smtp));
                if !smtp.production {
                    info!("IS_PROD is off: ticket mail is redirected to the test recipient");
                }
            }
            None => warn!("SMTP_HOST is not set: ticket emails are disabled"),
        }
        Ok(state)
    }

    pub fn render(&self, template: &str, data: &impl Serialize) -> Result<String> {
        self.templates
            .render(template, data)
            .map_err(|e| TombolaError::Template(e.to_string()))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/", get(orders_page))
        .route("/upload", post(upload_orders))
        .route("/orders/achat", post(edit_achat))
        .route("/orders/quantity", post(edit_quantity))
        .route("/orders/notify", post(notify_order))
        .route("/export.xlsx", get(export_xlsx))
        .route("/export.csv", get(export_csv))
        .route("/api/orders", get(api_orders))
        .route("/api/tickets", get(api_tickets))
        .route("/logout", post(login::handle_logout))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            login::require_auth,
        ));

    Router::new()
        .route(
            "/login",
            get(login::serve_login_page).post(login::handle_login),
        )
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
        .with_state(state)
}

pub async fn run(config: Config) -> std::result::Result<(), Box<dyn Error>> {
    let state = Arc::new(AppState::from_config(&config).await?);
    let app = router(state.clone());

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    state.store.close().await;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct Flash {
    success: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AchatForm {
    name: String,
    date: String,
    #[serde(default)]
    achat: String,
}

#[derive(Debug, Deserialize)]
struct QuantityForm {
    name: String,
    date: String,
    num_tickets: String,
}

/// One line of the orders table, with the ticket numbers it currently holds.
#[derive(Debug, Serialize)]
struct OrderRow<'a> {
    #[serde(flatten)]
    order: &'a Order,
    first_ticket: Option<String>,
    last_ticket: Option<String>,
}

#[derive(Debug, Serialize)]
struct TicketRow<'a> {
    ticket_id: u64,
    label: String,
    #[serde(flatten)]
    order: &'a Order,
}

/// Redirect to the orders page with the outcome of an action.
fn back_with(outcome: Result<String>) -> Redirect {
    let query = match outcome {
        Ok(message) => format!("success={}", urlencoding::encode(&message)),
        Err(e) => {
            warn!("{}", e);
            format!("error={}", urlencoding::encode(&e.to_string()))
        }
    };
    Redirect::to(&format!("/?{}", query))
}

fn error_page(err: TombolaError) -> Response {
    warn!("{}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

async fn health() -> &'static str {
    "ok"
}

async fn orders_page(State(state): State<Arc<AppState>>, Query(flash): Query<Flash>) -> Response {
    let orders = match state.store.list_all().await {
        Ok(orders) => orders,
        Err(e) => return error_page(e),
    };

    let mut pending = Vec::new();
    let mut processed = Vec::new();
    for (order, range) in ticket_ranges(&orders) {
        let row = OrderRow {
            order,
            first_ticket: range.as_ref().map(|r| ticket_label(*r.start())),
            last_ticket: range.as_ref().map(|r| ticket_label(*r.end())),
        };
        if order.is_notified() {
            processed.push(row);
        } else {
            pending.push(row);
        }
    }

    let data = serde_json::json!({
        "success": flash.success,
        "error": flash.error,
        "login_enabled": state.operator.is_some(),
        "mail_enabled": state.notifier.is_some(),
        "article": state.article,
        "min_date": state.min_date.map(|d| d.to_string()),
        "total_orders": orders.len(),
        "total_tickets": total_tickets(&orders),
        "pending_count": pending.len(),
        "processed_count": processed.len(),
        "pending": pending,
        "processed": processed,
    });

    match state.render("orders", &data) {
        Ok(html) => Html(html).into_response(),
        Err(e) => error_page(e),
    }
}

async fn upload_orders(State(state): State<Arc<AppState>>, multipart: Multipart) -> Redirect {
    back_with(import_upload(&state, multipart).await)
}

async fn import_upload(state: &AppState, mut multipart: Multipart) -> Result<String> {
    let upload_error = |e: axum::extract::multipart::MultipartError| {
        TombolaError::validation(format!("upload failed: {}", e))
    };

    let mut file_data = Vec::new();
    let mut min_date = state.min_date;
    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        match field.name() {
            Some("file") => file_data = field.bytes().await.map_err(upload_error)?.to_vec(),
            Some("min_date") => {
                let text = field.text().await.map_err(upload_error)?;
                min_date = match text.trim() {
                    "" => None,
                    day => Some(NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| {
                        TombolaError::validation(format!("'{}' is not a date (YYYY-MM-DD)", day))
                    })?),
                };
            }
            _ => {}
        }
    }

    if file_data.is_empty() {
        return Err(TombolaError::validation("No file data received"));
    }

    let options = ImportOptions {
        article: Some(state.article.clone()),
        min_date,
        ..ImportOptions::default()
    };
    let orders = read_orders(&file_data, &options)?;
    let summary = state.store.upsert_all(orders).await?;

    Ok(format!(
        "Imported {} order(s): {} new, {} updated",
        summary.total(),
        summary.inserted,
        summary.updated
    ))
}

async fn edit_achat(State(state): State<Arc<AppState>>, Form(form): Form<AchatForm>) -> Redirect {
    let outcome = state
        .store
        .update_achat(&form.name, &form.date, Some(form.achat))
        .await
        .map(|_| format!("Achat updated for {}.", form.name));
    back_with(outcome)
}

async fn edit_quantity(State(state): State<Arc<AppState>>, Form(form): Form<QuantityForm>) -> Redirect {
    let outcome = match parse_quantity(&form.num_tickets) {
        Ok(num_tickets) => state
            .store
            .update_quantity(&form.name, &form.date, num_tickets)
            .await
            .map(|_| format!("{} now has {} ticket(s).", form.name, num_tickets)),
        Err(e) => Err(e),
    };
    back_with(outcome)
}

fn parse_quantity(text: &str) -> Result<i64> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| TombolaError::validation(format!("'{}' is not a ticket quantity", text)))
}

async fn notify_order(State(state): State<Arc<AppState>>, Form(key): Form<OrderKey>) -> Redirect {
    let outcome = match &state.notifier {
        Some((notifier, recipients)) => {
            mailer::notify_order(&state.store, notifier.clone(), recipients, &key.name, &key.date)
                .await
                .map(|email| {
                    format!(
                        "Email sent to {}: tickets {} to {}.",
                        email.to, email.first_ticket, email.last_ticket
                    )
                })
        }
        None => Err(TombolaError::Notification(
            "email is not configured (SMTP_HOST)".to_string(),
        )),
    };
    back_with(outcome)
}

async fn export_xlsx(State(state): State<Arc<AppState>>) -> Response {
    let outcome = export_orders(&state)
        .await
        .and_then(|orders| downloader::to_xlsx(expand(&orders)));
    match outcome {
        Ok(bytes) => attachment(XLSX_MIME, "tickets_export.xlsx", bytes),
        Err(e) => back_with(Err(e)).into_response(),
    }
}

async fn export_csv(State(state): State<Arc<AppState>>) -> Response {
    let outcome = export_orders(&state)
        .await
        .and_then(|orders| downloader::to_csv(expand(&orders)));
    match outcome {
        Ok(text) => attachment("text/csv; charset=utf-8", "tickets_export.csv", text.into_bytes()),
        Err(e) => back_with(Err(e)).into_response(),
    }
}

async fn export_orders(state: &AppState) -> Result<Vec<Order>> {
    let orders = state.store.list_all().await?;
    if total_tickets(&orders) == 0 {
        return Err(TombolaError::Export("No tickets to export.".to_string()));
    }
    info!("Exporting {} ticket(s)", total_tickets(&orders));
    Ok(orders)
}

fn attachment(content_type: &str, filename: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}

async fn api_orders(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_all().await {
        Ok(orders) => Json(orders).into_response(),
        Err(e) => error_page(e),
    }
}

async fn api_tickets(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_all().await {
        Ok(orders) => {
            let tickets: Vec<TicketRow> = expand(&orders)
                .map(|ticket| TicketRow {
                    ticket_id: ticket.ticket_id,
                    label: ticket.label(),
                    order: ticket.order,
                })
                .collect();
            Json(tickets).into_response()
        }
        Err(e) => error_page(e),
    }
}
