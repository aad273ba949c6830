//! Access policy: a pure decision function from (actor, ticket) to the set
//! of operations the actor may perform. Handlers consult this before any
//! store mutation; an empty set means the request fails with access_denied.

use crate::auth::CurrentUser;
use crate::shared::models::{Role, Ticket, TicketStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub view: bool,
    pub respond: bool,
    /// Whether an `is_internal` flag on a response is honored. Students
    /// never get this; their flag is silently downgraded, not rejected.
    pub respond_internal: bool,
    pub assign: bool,
    pub change_status: bool,
    pub change_priority: bool,
    pub rate: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        view: false,
        respond: false,
        respond_internal: false,
        assign: false,
        change_status: false,
        change_priority: false,
        rate: false,
    };
}

pub fn capabilities(actor: &CurrentUser, ticket: &Ticket) -> Capabilities {
    match actor.role {
        Role::Admin => Capabilities {
            view: true,
            respond: true,
            respond_internal: true,
            assign: true,
            change_status: true,
            change_priority: true,
            rate: false,
        },
        Role::Staff => {
            if actor.department_id == Some(ticket.department_id) {
                Capabilities {
                    view: true,
                    respond: true,
                    respond_internal: true,
                    assign: true,
                    change_status: true,
                    change_priority: true,
                    rate: false,
                }
            } else {
                Capabilities::NONE
            }
        }
        Role::Student => {
            if actor.id == ticket.student_id {
                Capabilities {
                    view: true,
                    respond: true,
                    respond_internal: false,
                    assign: false,
                    change_status: false,
                    change_priority: false,
                    rate: ticket.status == TicketStatus::Resolved.as_str(),
                }
            } else {
                Capabilities::NONE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn ticket(student_id: Uuid, department_id: Uuid, status: TicketStatus) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            ticket_number: "TKT123456".to_string(),
            title: "Hall ticket missing".to_string(),
            description: "Cannot download my hall ticket".to_string(),
            status: status.as_str().to_string(),
            priority: "medium".to_string(),
            student_id,
            category_id: Uuid::new_v4(),
            department_id,
            assignee_id: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            satisfaction_rating: None,
        }
    }

    fn actor(role: Role, id: Uuid, department_id: Option<Uuid>) -> CurrentUser {
        CurrentUser {
            id,
            role,
            department_id,
        }
    }

    #[test]
    fn admin_has_everything_except_rate() {
        let t = ticket(Uuid::new_v4(), Uuid::new_v4(), TicketStatus::Open);
        let caps = capabilities(&actor(Role::Admin, Uuid::new_v4(), None), &t);
        assert!(caps.view && caps.respond && caps.respond_internal);
        assert!(caps.assign && caps.change_status && caps.change_priority);
        assert!(!caps.rate);
    }

    #[test]
    fn staff_in_department_triages() {
        let dept = Uuid::new_v4();
        let t = ticket(Uuid::new_v4(), dept, TicketStatus::Open);
        let caps = capabilities(&actor(Role::Staff, Uuid::new_v4(), Some(dept)), &t);
        assert!(caps.view && caps.respond && caps.respond_internal && caps.assign);
        assert!(caps.change_status && caps.change_priority);
        assert!(!caps.rate);
    }

    #[test]
    fn staff_outside_department_gets_nothing() {
        let t = ticket(Uuid::new_v4(), Uuid::new_v4(), TicketStatus::Open);
        let caps = capabilities(&actor(Role::Staff, Uuid::new_v4(), Some(Uuid::new_v4())), &t);
        assert_eq!(caps, Capabilities::NONE);
    }

    #[test]
    fn staff_without_department_gets_nothing() {
        let t = ticket(Uuid::new_v4(), Uuid::new_v4(), TicketStatus::Open);
        let caps = capabilities(&actor(Role::Staff, Uuid::new_v4(), None), &t);
        assert_eq!(caps, Capabilities::NONE);
    }

    #[test]
    fn owner_student_views_and_responds_public_only() {
        let student = Uuid::new_v4();
        let t = ticket(student, Uuid::new_v4(), TicketStatus::Open);
        let caps = capabilities(&actor(Role::Student, student, None), &t);
        assert!(caps.view && caps.respond);
        assert!(!caps.respond_internal);
        assert!(!caps.assign && !caps.change_status && !caps.change_priority);
        assert!(!caps.rate, "open ticket is not rateable");
    }

    #[test]
    fn owner_student_rates_only_resolved() {
        let student = Uuid::new_v4();
        for status in TicketStatus::ALL {
            let t = ticket(student, Uuid::new_v4(), status);
            let caps = capabilities(&actor(Role::Student, student, None), &t);
            assert_eq!(caps.rate, status == TicketStatus::Resolved);
        }
    }

    #[test]
    fn foreign_student_gets_nothing() {
        let t = ticket(Uuid::new_v4(), Uuid::new_v4(), TicketStatus::Resolved);
        let caps = capabilities(&actor(Role::Student, Uuid::new_v4(), None), &t);
        assert_eq!(caps, Capabilities::NONE);
        assert!(!caps.view);
    }
}
