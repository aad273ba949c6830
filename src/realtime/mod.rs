//! Real-time notification fan-out. Connected clients live in rooms (one per
//! user, per department, a shared admin room, and opt-in per-ticket rooms);
//! lifecycle mutations publish event envelopes to a fixed room set per event
//! kind. Delivery is best-effort: a room with no listeners, a lagging client,
//! or a dropped connection never fails the mutation that triggered it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use diesel::prelude::*;

use crate::auth::CurrentUser;
use crate::shared::error::ApiError;
use crate::shared::models::{Role, Ticket, TicketResponse, User};
use crate::shared::schema::users;
use crate::shared::state::AppState;

/// A logical broadcast group. Membership is derived from the connection's
/// identity (user/department/admin) or joined explicitly (ticket rooms);
/// it is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    User(Uuid),
    Department(Uuid),
    Admin,
    Ticket(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Department(id) => write!(f, "dept:{id}"),
            Self::Admin => write!(f, "admin"),
            Self::Ticket(id) => write!(f, "ticket:{id}"),
        }
    }
}

/// One event as delivered to a subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub event: String,
    pub data: serde_json::Value,
}

impl Envelope {
    fn new(event: &str, data: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

type ConnSender = mpsc::UnboundedSender<Envelope>;

/// Identity attached to a live connection, as reported by `online_users`.
#[derive(Debug, Clone, Serialize)]
pub struct OnlineUser {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub role: String,
}

/// Room registry plus publish API. Owned by `AppState`; the websocket
/// handler registers connections, lifecycle handlers publish through the
/// `notify_*` methods. `sessions` tracks which user each connection belongs
/// to so online presence can be enumerated.
#[derive(Default)]
pub struct Notifier {
    rooms: RwLock<HashMap<Room, HashMap<Uuid, ConnSender>>>,
    sessions: RwLock<HashMap<Uuid, OnlineUser>>,
}

/// Rooms told about a brand-new ticket: the owning department and admins.
/// The creator gets the HTTP response instead.
pub fn created_rooms(ticket: &Ticket) -> Vec<Room> {
    vec![Room::Department(ticket.department_id), Room::Admin]
}

/// Rooms told about status/priority/assignment changes: creator,
/// department, admins, and anyone watching this ticket.
pub fn update_rooms(ticket: &Ticket) -> Vec<Room> {
    vec![
        Room::User(ticket.student_id),
        Room::Department(ticket.department_id),
        Room::Admin,
        Room::Ticket(ticket.id),
    ]
}

/// Same set as updates, except internal responses skip the creator's
/// personal room so staff notes stay invisible to the student.
pub fn response_rooms(ticket: &Ticket, is_internal: bool) -> Vec<Room> {
    let mut rooms = update_rooms(ticket);
    if is_internal {
        rooms.retain(|r| *r != Room::User(ticket.student_id));
    }
    rooms
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, room: Room, conn_id: Uuid, sender: ConnSender) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room).or_default().insert(conn_id, sender);
    }

    pub async fn leave(&self, room: Room, conn_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
    }

    pub async fn register(&self, conn_id: Uuid, user: OnlineUser) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(conn_id, user);
    }

    /// Users with at least one live connection, one entry per user no
    /// matter how many sockets they hold open.
    pub async fn online_users(&self) -> Vec<OnlineUser> {
        let sessions = self.sessions.read().await;
        let mut seen: HashMap<Uuid, OnlineUser> = HashMap::new();
        for user in sessions.values() {
            seen.entry(user.id).or_insert_with(|| user.clone());
        }
        seen.into_values().collect()
    }

    /// Drops the connection from every room it joined and from the
    /// presence registry. Called on socket close; has no effect on ticket
    /// state.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
        drop(rooms);
        let mut sessions = self.sessions.write().await;
        sessions.remove(&conn_id);
    }

    /// Best-effort delivery to every member of `room`. Send failures mean
    /// the connection is already gone and are ignored.
    pub async fn emit(&self, room: Room, event: &str, data: serde_json::Value) {
        let rooms = self.rooms.read().await;
        if let Some(members) = rooms.get(&room) {
            let envelope = Envelope::new(event, data);
            for sender in members.values() {
                let _ = sender.send(envelope.clone());
            }
        }
    }

    async fn emit_all(&self, rooms: &[Room], event: &str, data: serde_json::Value) {
        for room in rooms {
            self.emit(*room, event, data.clone()).await;
        }
    }

    pub async fn notify_created(&self, ticket: &Ticket) {
        let data = json!({
            "ticket": ticket,
            "message": format!("New ticket created: {}", ticket.title),
        });
        self.emit_all(&created_rooms(ticket), "ticket.created", data)
            .await;
    }

    pub async fn notify_updated(&self, ticket: &Ticket, update_type: &str, message: String) {
        let data = json!({
            "ticket": ticket,
            "update_type": update_type,
            "message": message,
        });
        self.emit_all(&update_rooms(ticket), "ticket.updated", data)
            .await;
    }

    pub async fn notify_response(&self, ticket: &Ticket, response: &TicketResponse) {
        let data = json!({
            "ticket": ticket,
            "response": response,
            "message": format!("New response on ticket {}", ticket.ticket_number),
        });
        self.emit_all(
            &response_rooms(ticket, response.is_internal),
            "ticket.responded",
            data,
        )
        .await;
    }

    pub async fn notify_assignment(&self, ticket: &Ticket, assignee: Option<&User>) {
        if let Some(staff) = assignee {
            self.emit(
                Room::User(staff.id),
                "ticket.assigned",
                json!({
                    "ticket": ticket,
                    "message": format!("Ticket {} has been assigned to you", ticket.ticket_number),
                }),
            )
            .await;
            self.emit(
                Room::User(ticket.student_id),
                "ticket.updated",
                json!({
                    "ticket": ticket,
                    "update_type": "assignment",
                    "message": format!("Your ticket has been assigned to {}", staff.full_name),
                }),
            )
            .await;
        }
    }
}

/// Client-to-server messages: ticket-room membership and presence queries.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    action: String,
    ticket_id: Option<Uuid>,
}

/// Upgrade rejected outright (401) when no authenticated identity is
/// attached; the `CurrentUser` extractor runs before the upgrade completes,
/// and so does the profile load backing the presence registry.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state.conn.get()?;
    let profile: User = users::table
        .find(user.id)
        .first(&mut conn)
        .optional()?
        .ok_or(ApiError::Unauthenticated)?;
    let online = OnlineUser {
        id: profile.id,
        username: profile.username,
        full_name: profile.full_name,
        role: profile.role,
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user, online)))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    user: CurrentUser,
    online: OnlineUser,
) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let notifier = state.notifier.clone();

    notifier.register(conn_id, online).await;
    notifier.join(Room::User(user.id), conn_id, tx.clone()).await;
    if user.role == Role::Staff {
        if let Some(dept) = user.department_id {
            notifier.join(Room::Department(dept), conn_id, tx.clone()).await;
        }
    }
    if user.role == Role::Admin {
        notifier.join(Room::Admin, conn_id, tx.clone()).await;
    }

    let _ = tx.send(Envelope::new(
        "connected",
        json!({ "message": "Connected successfully" }),
    ));
    tracing::debug!(user = %user.id, %conn_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to serialize envelope"),
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<ClientMessage>(&text) else {
                    continue;
                };
                match (parsed.action.as_str(), parsed.ticket_id) {
                    ("join_ticket_room", Some(ticket_id)) => {
                        notifier.join(Room::Ticket(ticket_id), conn_id, tx.clone()).await;
                        let _ = tx.send(Envelope::new(
                            "ticket_room.joined",
                            json!({ "ticket_id": ticket_id }),
                        ));
                    }
                    ("leave_ticket_room", Some(ticket_id)) => {
                        notifier.leave(Room::Ticket(ticket_id), conn_id).await;
                        let _ = tx.send(Envelope::new(
                            "ticket_room.left",
                            json!({ "ticket_id": ticket_id }),
                        ));
                    }
                    ("get_online_users", _) => {
                        let users = notifier.online_users().await;
                        let _ = tx.send(Envelope::new(
                            "online_users",
                            json!({ "users": users }),
                        ));
                    }
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    notifier.disconnect(conn_id).await;
    drop(tx);
    send_task.abort();
    tracing::debug!(user = %user.id, %conn_id, "websocket disconnected");
}

pub fn configure_realtime_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(websocket_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ticket() -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            ticket_number: "TKT000042".to_string(),
            title: "Library card blocked".to_string(),
            description: "Card rejected at the gate".to_string(),
            status: "open".to_string(),
            priority: "medium".to_string(),
            student_id: Uuid::new_v4(),
            category_id: Uuid::new_v4(),
            department_id: Uuid::new_v4(),
            assignee_id: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            satisfaction_rating: None,
        }
    }

    fn staff(department_id: Uuid) -> User {
        User {
            id: Uuid::new_v4(),
            username: "mkhan".to_string(),
            email: "mkhan@campus.test".to_string(),
            full_name: "M. Khan".to_string(),
            role: "staff".to_string(),
            student_number: None,
            department_id: Some(department_id),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn created_goes_to_department_and_admin_only() {
        let t = ticket();
        let rooms = created_rooms(&t);
        assert_eq!(rooms, vec![Room::Department(t.department_id), Room::Admin]);
    }

    #[test]
    fn updates_fan_out_to_all_four_rooms() {
        let t = ticket();
        let rooms = update_rooms(&t);
        assert_eq!(rooms.len(), 4);
        assert!(rooms.contains(&Room::User(t.student_id)));
        assert!(rooms.contains(&Room::Department(t.department_id)));
        assert!(rooms.contains(&Room::Admin));
        assert!(rooms.contains(&Room::Ticket(t.id)));
    }

    #[test]
    fn internal_response_skips_creator_room() {
        let t = ticket();
        let rooms = response_rooms(&t, true);
        assert!(!rooms.contains(&Room::User(t.student_id)));
        assert_eq!(rooms.len(), 3);

        let public = response_rooms(&t, false);
        assert!(public.contains(&Room::User(t.student_id)));
        assert_eq!(public.len(), 4);
    }

    #[tokio::test]
    async fn emit_reaches_joined_member() {
        let notifier = Notifier::new();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        notifier.join(Room::Admin, conn, tx).await;

        notifier.emit(Room::Admin, "ticket.created", json!({"x": 1})).await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, "ticket.created");
        assert_eq!(envelope.data["x"], 1);
    }

    #[tokio::test]
    async fn emit_to_empty_room_is_a_noop() {
        let notifier = Notifier::new();
        // No subscribers anywhere; must not panic or error.
        notifier.emit(Room::Admin, "ticket.created", json!({})).await;
        notifier.notify_created(&ticket()).await;
    }

    #[tokio::test]
    async fn disconnect_removes_all_memberships() {
        let notifier = Notifier::new();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = ticket();
        notifier.join(Room::User(t.student_id), conn, tx.clone()).await;
        notifier.join(Room::Ticket(t.id), conn, tx.clone()).await;
        drop(tx);

        notifier.disconnect(conn).await;
        notifier.notify_updated(&t, "status", "noop".to_string()).await;
        assert!(rx.recv().await.is_none(), "no delivery after disconnect");
    }

    fn online(user: &User) -> OnlineUser {
        OnlineUser {
            id: user.id,
            username: user.username.clone(),
            full_name: user.full_name.clone(),
            role: user.role.clone(),
        }
    }

    #[tokio::test]
    async fn online_users_deduplicates_by_user() {
        let notifier = Notifier::new();
        let member = staff(Uuid::new_v4());

        // Two tabs, one user.
        notifier.register(Uuid::new_v4(), online(&member)).await;
        notifier.register(Uuid::new_v4(), online(&member)).await;

        let list = notifier.online_users().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, member.id);
        assert_eq!(list[0].username, "mkhan");
    }

    #[tokio::test]
    async fn disconnect_removes_online_presence() {
        let notifier = Notifier::new();
        let member = staff(Uuid::new_v4());
        let conn = Uuid::new_v4();
        notifier.register(conn, online(&member)).await;
        assert_eq!(notifier.online_users().await.len(), 1);

        notifier.disconnect(conn).await;
        assert!(notifier.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn assignment_notifies_assignee_and_creator() {
        let notifier = Notifier::new();
        let t = ticket();
        let assignee = staff(t.department_id);

        let (staff_tx, mut staff_rx) = mpsc::unbounded_channel();
        let (student_tx, mut student_rx) = mpsc::unbounded_channel();
        notifier.join(Room::User(assignee.id), Uuid::new_v4(), staff_tx).await;
        notifier.join(Room::User(t.student_id), Uuid::new_v4(), student_tx).await;

        notifier.notify_assignment(&t, Some(&assignee)).await;

        let to_staff = staff_rx.recv().await.unwrap();
        assert_eq!(to_staff.event, "ticket.assigned");
        let to_student = student_rx.recv().await.unwrap();
        assert_eq!(to_student.event, "ticket.updated");
        assert_eq!(to_student.data["update_type"], "assignment");
    }

    #[tokio::test]
    async fn clearing_assignment_notifies_nobody() {
        let notifier = Notifier::new();
        let t = ticket();
        let (tx, mut rx) = mpsc::unbounded_channel();
        notifier.join(Room::User(t.student_id), Uuid::new_v4(), tx).await;

        notifier.notify_assignment(&t, None).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn internal_response_not_delivered_to_student() {
        let notifier = Notifier::new();
        let t = ticket();
        let (student_tx, mut student_rx) = mpsc::unbounded_channel();
        let (admin_tx, mut admin_rx) = mpsc::unbounded_channel();
        notifier.join(Room::User(t.student_id), Uuid::new_v4(), student_tx).await;
        notifier.join(Room::Admin, Uuid::new_v4(), admin_tx).await;

        let response = TicketResponse {
            id: Uuid::new_v4(),
            ticket_id: t.id,
            author_id: Uuid::new_v4(),
            message: "internal note".to_string(),
            is_internal: true,
            created_at: Utc::now(),
        };
        notifier.notify_response(&t, &response).await;

        assert_eq!(admin_rx.recv().await.unwrap().event, "ticket.responded");
        assert!(student_rx.try_recv().is_err());
    }
}
