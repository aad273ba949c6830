//! Ticket lifecycle engine and HTTP surface. Every mutation authenticates,
//! consults the access policy, commits inside the store, then fans out a
//! real-time event without blocking the response on delivery.

pub mod lifecycle;

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use diesel::dsl::exists;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::policy;
use crate::shared::error::ApiError;
use crate::shared::models::{
    Role, Ticket, TicketCategory, TicketPriority, TicketResponse, TicketStatus, User,
};
use crate::shared::schema::{departments, ticket_categories, ticket_responses, tickets, users};
use crate::shared::state::AppState;
use lifecycle::TicketStats;

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub message: Option<String>,
    pub is_internal: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub staff_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePriorityRequest {
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub rating: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct MyTicketsQuery {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ResponseView {
    #[serde(flatten)]
    response: TicketResponse,
    author_name: String,
    author_role: String,
}

#[derive(Debug, Serialize)]
struct TicketDetail {
    #[serde(flatten)]
    ticket: Ticket,
    student_name: Option<String>,
    category_name: Option<String>,
    department_name: Option<String>,
    assigned_staff_name: Option<String>,
    responses: Vec<ResponseView>,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::Validation(format!("{field} is required")))
}

fn required_text(value: Option<String>, field: &str) -> Result<String, ApiError> {
    let text = required(value, field)?;
    if text.trim().is_empty() {
        return Err(ApiError::Validation(format!("{field} is required")));
    }
    Ok(text)
}

fn load_ticket(conn: &mut PgConnection, id: Uuid) -> Result<Ticket, ApiError> {
    tickets::table
        .find(id)
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound("ticket not found".to_string()))
}

/// Resolved `(page, per_page, offset)` for a listing request. The offset is
/// saturating so an absurd page number yields an empty page, not an overflow.
fn page_window(page: Option<i64>, per_page: Option<i64>) -> (i64, i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let per_page = per_page.unwrap_or(10).clamp(1, 100);
    let offset = (page - 1).saturating_mul(per_page);
    (page, per_page, offset)
}

/// Role-scoped base query: students see their own tickets, staff their
/// department's, admins everything.
fn scoped_tickets(user: &CurrentUser) -> tickets::BoxedQuery<'static, Pg> {
    let mut query = tickets::table.into_boxed();
    match user.role {
        Role::Student => query = query.filter(tickets::student_id.eq(user.id)),
        Role::Staff => {
            query = query.filter(tickets::department_id.nullable().eq(user.department_id));
        }
        Role::Admin => {}
    }
    query
}

async fn get_categories(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.conn.get()?;
    let categories: Vec<TicketCategory> = ticket_categories::table
        .filter(ticket_categories::is_active.eq(true))
        .order(ticket_categories::name.asc())
        .load(&mut conn)?;
    Ok(Json(json!({ "categories": categories })))
}

async fn create_ticket(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(req): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    user.require_role(&[Role::Student])?;

    let title = required_text(req.title, "title")?;
    let description = required_text(req.description, "description")?;
    let category_id = required(req.category_id, "category_id")?;
    let department_id = required(req.department_id, "department_id")?;
    let priority = match req.priority {
        Some(p) => TicketPriority::from_str(&p)?,
        None => TicketPriority::Medium,
    };

    let mut conn = state.conn.get()?;

    let category: Option<TicketCategory> = ticket_categories::table
        .find(category_id)
        .first(&mut conn)
        .optional()?;
    if category.is_none() {
        return Err(ApiError::Validation("invalid category".to_string()));
    }
    let department_exists: bool = diesel::select(exists(
        departments::table.find(department_id),
    ))
    .get_result(&mut conn)?;
    if !department_exists {
        return Err(ApiError::Validation("invalid department".to_string()));
    }

    // Check-and-retry: a concurrent creation can win the race between the
    // existence check and the insert, in which case the unique constraint
    // fires and we regenerate.
    let mut created: Option<Ticket> = None;
    for _ in 0..lifecycle::MAX_TICKET_NUMBER_ATTEMPTS {
        let number = lifecycle::generate_ticket_number(|candidate| {
            let taken: bool = diesel::select(exists(
                tickets::table.filter(tickets::ticket_number.eq(candidate)),
            ))
            .get_result(&mut conn)?;
            Ok(taken)
        })?;

        let now = Utc::now();
        let ticket = Ticket {
            id: Uuid::new_v4(),
            ticket_number: number,
            title: title.clone(),
            description: description.clone(),
            status: TicketStatus::Open.as_str().to_string(),
            priority: priority.as_str().to_string(),
            student_id: user.id,
            category_id,
            department_id,
            assignee_id: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            satisfaction_rating: None,
        };

        match diesel::insert_into(tickets::table)
            .values(&ticket)
            .execute(&mut conn)
        {
            Ok(_) => {
                created = Some(ticket);
                break;
            }
            Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    let ticket = created
        .ok_or_else(|| ApiError::Conflict("ticket number space exhausted".to_string()))?;

    tracing::info!(ticket = %ticket.ticket_number, student = %user.id, "ticket created");
    state.notifier.notify_created(&ticket).await;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Ticket created successfully", "ticket": ticket })),
    ))
}

async fn my_tickets(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Query(query): Query<MyTicketsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (page, per_page, offset) = page_window(query.page, query.per_page);
    let status = match &query.status {
        Some(s) => Some(TicketStatus::from_str(s)?),
        None => None,
    };

    let mut conn = state.conn.get()?;

    let mut count_query = scoped_tickets(&user);
    let mut page_query = scoped_tickets(&user);
    if let Some(status) = status {
        count_query = count_query.filter(tickets::status.eq(status.as_str()));
        page_query = page_query.filter(tickets::status.eq(status.as_str()));
    }

    let total: i64 = count_query.count().get_result(&mut conn)?;
    let items: Vec<Ticket> = page_query
        .order(tickets::created_at.desc())
        .limit(per_page)
        .offset(offset)
        .load(&mut conn)?;

    let pages = (total + per_page - 1) / per_page;
    Ok(Json(json!({
        "tickets": items,
        "total": total,
        "pages": pages,
        "current_page": page,
    })))
}

async fn get_ticket(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = state.conn.get()?;
    let ticket = load_ticket(&mut conn, id)?;

    let caps = policy::capabilities(&user, &ticket);
    if !caps.view {
        return Err(ApiError::AccessDenied);
    }

    let mut responses: Vec<(TicketResponse, String, String)> = ticket_responses::table
        .inner_join(users::table)
        .filter(ticket_responses::ticket_id.eq(ticket.id))
        .order(ticket_responses::created_at.asc())
        .select((
            ticket_responses::all_columns,
            users::full_name,
            users::role,
        ))
        .load(&mut conn)?;
    // Internal staff notes stay hidden from the student creator.
    if !caps.respond_internal {
        responses.retain(|(r, _, _)| !r.is_internal);
    }

    let student_name: Option<String> = users::table
        .find(ticket.student_id)
        .select(users::full_name)
        .first(&mut conn)
        .optional()?;
    let category_name: Option<String> = ticket_categories::table
        .find(ticket.category_id)
        .select(ticket_categories::name)
        .first(&mut conn)
        .optional()?;
    let department_name: Option<String> = departments::table
        .find(ticket.department_id)
        .select(departments::name)
        .first(&mut conn)
        .optional()?;
    let assigned_staff_name: Option<String> = match ticket.assignee_id {
        Some(assignee) => users::table
            .find(assignee)
            .select(users::full_name)
            .first(&mut conn)
            .optional()?,
        None => None,
    };

    let detail = TicketDetail {
        ticket,
        student_name,
        category_name,
        department_name,
        assigned_staff_name,
        responses: responses
            .into_iter()
            .map(|(response, author_name, author_role)| ResponseView {
                response,
                author_name,
                author_role,
            })
            .collect(),
    };
    Ok(Json(json!({ "ticket": detail })))
}

async fn respond_to_ticket(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<RespondRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let mut conn = state.conn.get()?;
    let mut ticket = load_ticket(&mut conn, id)?;

    let caps = policy::capabilities(&user, &ticket);
    if !caps.respond {
        return Err(ApiError::AccessDenied);
    }

    let message = required_text(req.message, "message")?;
    let is_internal = lifecycle::effective_internal_flag(req.is_internal, &caps);

    let now = Utc::now();
    let response = TicketResponse {
        id: Uuid::new_v4(),
        ticket_id: ticket.id,
        author_id: user.id,
        message,
        is_internal,
        created_at: now,
    };

    conn.transaction::<_, ApiError, _>(|conn| {
        diesel::insert_into(ticket_responses::table)
            .values(&response)
            .execute(conn)?;
        diesel::update(tickets::table.find(ticket.id))
            .set(tickets::updated_at.eq(now))
            .execute(conn)?;
        Ok(())
    })?;
    ticket.updated_at = now;

    state.notifier.notify_response(&ticket, &response).await;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Response added successfully", "response": response })),
    ))
}

async fn assign_ticket(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require_role(&[Role::Staff, Role::Admin])?;

    let mut conn = state.conn.get()?;
    let mut ticket = load_ticket(&mut conn, id)?;

    if !policy::capabilities(&user, &ticket).assign {
        return Err(ApiError::AccessDenied);
    }

    let assignee: Option<User> = match req.staff_id {
        Some(staff_id) => {
            let staff: Option<User> = users::table.find(staff_id).first(&mut conn).optional()?;
            let staff = staff
                .filter(|s| s.role == Role::Staff.as_str())
                .ok_or_else(|| ApiError::Validation("invalid staff member".to_string()))?;
            if staff.department_id != Some(ticket.department_id) {
                return Err(ApiError::Validation(
                    "staff member not in ticket department".to_string(),
                ));
            }
            Some(staff)
        }
        None => None,
    };

    let now = Utc::now();
    ticket.assignee_id = assignee.as_ref().map(|s| s.id);
    ticket.updated_at = now;
    diesel::update(tickets::table.find(ticket.id))
        .set((
            tickets::assignee_id.eq(ticket.assignee_id),
            tickets::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    state
        .notifier
        .notify_assignment(&ticket, assignee.as_ref())
        .await;

    Ok(Json(json!({
        "message": "Ticket assignment updated successfully",
        "ticket": ticket,
    })))
}

async fn change_status(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeStatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require_role(&[Role::Staff, Role::Admin])?;

    let mut conn = state.conn.get()?;
    let mut ticket = load_ticket(&mut conn, id)?;

    if !policy::capabilities(&user, &ticket).change_status {
        return Err(ApiError::AccessDenied);
    }

    let new_status = TicketStatus::from_str(&required(req.status, "status")?)?;
    let old_status = ticket.status.clone();
    lifecycle::apply_status_change(&mut ticket, new_status, Utc::now());

    diesel::update(tickets::table.find(ticket.id))
        .set((
            tickets::status.eq(&ticket.status),
            tickets::updated_at.eq(ticket.updated_at),
            tickets::resolved_at.eq(ticket.resolved_at),
        ))
        .execute(&mut conn)?;

    state
        .notifier
        .notify_updated(
            &ticket,
            "status",
            format!("Ticket status changed from {old_status} to {new_status}"),
        )
        .await;

    Ok(Json(json!({
        "message": "Ticket status updated successfully",
        "ticket": ticket,
    })))
}

async fn change_priority(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangePriorityRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require_role(&[Role::Staff, Role::Admin])?;

    let mut conn = state.conn.get()?;
    let mut ticket = load_ticket(&mut conn, id)?;

    if !policy::capabilities(&user, &ticket).change_priority {
        return Err(ApiError::AccessDenied);
    }

    let new_priority = TicketPriority::from_str(&required(req.priority, "priority")?)?;
    let old_priority = ticket.priority.clone();
    lifecycle::apply_priority_change(&mut ticket, new_priority, Utc::now());

    diesel::update(tickets::table.find(ticket.id))
        .set((
            tickets::priority.eq(&ticket.priority),
            tickets::updated_at.eq(ticket.updated_at),
        ))
        .execute(&mut conn)?;

    state
        .notifier
        .notify_updated(
            &ticket,
            "priority",
            format!("Ticket priority changed from {old_priority} to {new_priority}"),
        )
        .await;

    Ok(Json(json!({
        "message": "Ticket priority updated successfully",
        "ticket": ticket,
    })))
}

async fn rate_ticket(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<RateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require_role(&[Role::Student])?;

    let mut conn = state.conn.get()?;
    let mut ticket = load_ticket(&mut conn, id)?;

    if ticket.student_id != user.id {
        return Err(ApiError::AccessDenied);
    }
    if ticket.status != TicketStatus::Resolved.as_str() {
        return Err(ApiError::Validation(
            "can only rate resolved tickets".to_string(),
        ));
    }

    let rating = required(req.rating, "rating")?;
    lifecycle::validate_rating(rating)?;

    ticket.satisfaction_rating = Some(rating);
    diesel::update(tickets::table.find(ticket.id))
        .set(tickets::satisfaction_rating.eq(Some(rating)))
        .execute(&mut conn)?;

    // Ratings are not broadcast.
    Ok(Json(json!({
        "message": "Rating submitted successfully",
        "ticket": ticket,
    })))
}

async fn ticket_stats(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require_role(&[Role::Staff, Role::Admin])?;

    let mut conn = state.conn.get()?;
    let mut query = tickets::table
        .select((
            tickets::status,
            tickets::priority,
            tickets::satisfaction_rating,
        ))
        .into_boxed();
    if user.role == Role::Staff {
        query = query.filter(tickets::department_id.nullable().eq(user.department_id));
    }
    let rows: Vec<(String, String, Option<i32>)> = query.load(&mut conn)?;

    Ok(Json(json!({ "stats": TicketStats::from_rows(&rows) })))
}

pub fn configure_tickets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tickets/categories", get(get_categories))
        .route("/api/tickets/create", post(create_ticket))
        .route("/api/tickets/my-tickets", get(my_tickets))
        .route("/api/tickets/stats", get(ticket_stats))
        .route("/api/tickets/:id", get(get_ticket))
        .route("/api/tickets/:id/respond", post(respond_to_ticket))
        .route("/api/tickets/:id/assign", post(assign_ticket))
        .route("/api/tickets/:id/status", post(change_status))
        .route("/api/tickets/:id/priority", post(change_priority))
        .route("/api/tickets/:id/rate", post(rate_ticket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_window_defaults() {
        assert_eq!(page_window(None, None), (1, 10, 0));
    }

    #[test]
    fn page_window_clamps_inputs() {
        assert_eq!(page_window(Some(0), Some(0)), (1, 1, 0));
        assert_eq!(page_window(Some(-5), Some(1000)), (1, 100, 0));
        assert_eq!(page_window(Some(3), Some(20)), (3, 20, 40));
    }

    #[test]
    fn page_window_survives_huge_page_numbers() {
        let (_, _, offset) = page_window(Some(i64::MAX), Some(100));
        assert!(offset >= 0, "offset must never wrap negative");
        assert_eq!(offset, i64::MAX);
    }
}
