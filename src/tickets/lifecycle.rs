//! Pure pieces of the ticket lifecycle: identifier generation, status
//! transition bookkeeping, rating bounds, and stats aggregation. Everything
//! here is store-free so it can be tested without a database.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::policy::Capabilities;
use crate::shared::error::ApiError;
use crate::shared::models::{Ticket, TicketPriority, TicketStatus};

/// Identifier collisions are resolved by regeneration; the cap turns a
/// pathological chain of collisions into a conflict error instead of an
/// unbounded loop. The unique column constraint is the final authority.
pub const MAX_TICKET_NUMBER_ATTEMPTS: usize = 16;

pub fn candidate_ticket_number() -> String {
    format!("TKT{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

/// Check-and-retry generation. `is_taken` consults the store; a candidate
/// that races past this check still hits the unique constraint at insert
/// time, which callers treat as one more collision.
pub fn generate_ticket_number<F>(mut is_taken: F) -> Result<String, ApiError>
where
    F: FnMut(&str) -> Result<bool, ApiError>,
{
    for _ in 0..MAX_TICKET_NUMBER_ATTEMPTS {
        let candidate = candidate_ticket_number();
        if !is_taken(&candidate)? {
            return Ok(candidate);
        }
    }
    Err(ApiError::Conflict(
        "ticket number space exhausted".to_string(),
    ))
}

/// Any status may move to any other, including no-ops. Entering `resolved`
/// stamps `resolved_at`; leaving it deliberately does not clear the stamp,
/// keeping a record that the ticket was resolved at least once.
pub fn apply_status_change(ticket: &mut Ticket, new_status: TicketStatus, now: DateTime<Utc>) {
    ticket.status = new_status.as_str().to_string();
    ticket.updated_at = now;
    if new_status == TicketStatus::Resolved {
        ticket.resolved_at = Some(now);
    }
}

pub fn apply_priority_change(ticket: &mut Ticket, new_priority: TicketPriority, now: DateTime<Utc>) {
    ticket.priority = new_priority.as_str().to_string();
    ticket.updated_at = now;
}

/// The stored `is_internal` flag for a response. A requested flag from an
/// actor without the internal-note capability is silently downgraded to a
/// public response rather than rejected, so students can never file (or be
/// blocked by) a note they are not allowed to see.
pub fn effective_internal_flag(requested: Option<bool>, caps: &Capabilities) -> bool {
    requested.unwrap_or(false) && caps.respond_internal
}

pub fn validate_rating(rating: i32) -> Result<(), ApiError> {
    if (1..=5).contains(&rating) {
        Ok(())
    } else {
        Err(ApiError::Validation(
            "rating must be between 1 and 5".to_string(),
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct StatusCounts {
    pub open: i64,
    pub in_progress: i64,
    pub resolved: i64,
    pub closed: i64,
}

#[derive(Debug, Serialize)]
pub struct PriorityCounts {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
    pub urgent: i64,
}

#[derive(Debug, Serialize)]
pub struct TicketStats {
    pub total: i64,
    #[serde(flatten)]
    pub by_status: StatusCounts,
    pub priority: PriorityCounts,
    pub average_rating: Option<f64>,
}

impl TicketStats {
    /// Aggregates `(status, priority, satisfaction_rating)` rows. The
    /// average covers resolved tickets that actually carry a rating and is
    /// rounded to two decimals; `None` when there are none.
    pub fn from_rows(rows: &[(String, String, Option<i32>)]) -> Self {
        let mut by_status = StatusCounts {
            open: 0,
            in_progress: 0,
            resolved: 0,
            closed: 0,
        };
        let mut priority = PriorityCounts {
            low: 0,
            medium: 0,
            high: 0,
            urgent: 0,
        };
        let mut rating_sum = 0i64;
        let mut rating_count = 0i64;

        for (status, prio, rating) in rows {
            match status.as_str() {
                "open" => by_status.open += 1,
                "in_progress" => by_status.in_progress += 1,
                "resolved" => by_status.resolved += 1,
                "closed" => by_status.closed += 1,
                _ => {}
            }
            match prio.as_str() {
                "low" => priority.low += 1,
                "medium" => priority.medium += 1,
                "high" => priority.high += 1,
                "urgent" => priority.urgent += 1,
                _ => {}
            }
            if status == "resolved" {
                if let Some(r) = rating {
                    rating_sum += i64::from(*r);
                    rating_count += 1;
                }
            }
        }

        let average_rating = if rating_count > 0 {
            #[allow(clippy::cast_precision_loss)]
            let avg = rating_sum as f64 / rating_count as f64;
            Some((avg * 100.0).round() / 100.0)
        } else {
            None
        };

        Self {
            total: rows.len() as i64,
            by_status,
            priority,
            average_rating,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn ticket(status: TicketStatus) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            ticket_number: "TKT000001".to_string(),
            title: "Hostel wifi down".to_string(),
            description: "Block C has no connectivity".to_string(),
            status: status.as_str().to_string(),
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

    #[test]
    fn candidate_matches_fixed_format() {
        for _ in 0..100 {
            let n = candidate_ticket_number();
            assert_eq!(n.len(), 9);
            assert!(n.starts_with("TKT"));
            assert!(n[3..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn generation_is_unique_across_a_thousand_tickets() {
        let mut taken: HashSet<String> = HashSet::new();
        for _ in 0..1000 {
            let n = generate_ticket_number(|candidate| Ok(taken.contains(candidate))).unwrap();
            assert!(taken.insert(n), "duplicate ticket number issued");
        }
    }

    #[test]
    fn exhausted_retries_surface_as_conflict() {
        let err = generate_ticket_number(|_| Ok(true)).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn generation_propagates_store_errors() {
        let err = generate_ticket_number(|_| {
            Err(ApiError::Internal(anyhow::anyhow!("connection lost")))
        })
        .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn entering_resolved_stamps_resolved_at() {
        let mut t = ticket(TicketStatus::Open);
        let now = Utc::now();
        apply_status_change(&mut t, TicketStatus::Resolved, now);
        assert_eq!(t.status, "resolved");
        assert_eq!(t.resolved_at, Some(now));
        assert_eq!(t.updated_at, now);
    }

    #[test]
    fn leaving_resolved_keeps_resolved_at() {
        let mut t = ticket(TicketStatus::Open);
        let first = Utc::now();
        apply_status_change(&mut t, TicketStatus::Resolved, first);
        apply_status_change(&mut t, TicketStatus::InProgress, Utc::now());
        assert_eq!(t.status, "in_progress");
        assert_eq!(t.resolved_at, Some(first), "resolved_at is never cleared");
    }

    #[test]
    fn reresolving_restamps_resolved_at() {
        let mut t = ticket(TicketStatus::Open);
        let first = Utc::now();
        apply_status_change(&mut t, TicketStatus::Resolved, first);
        apply_status_change(&mut t, TicketStatus::Open, Utc::now());
        let second = Utc::now();
        apply_status_change(&mut t, TicketStatus::Resolved, second);
        assert_eq!(t.resolved_at, Some(second));
    }

    #[test]
    fn no_op_transition_is_permitted() {
        let mut t = ticket(TicketStatus::Closed);
        apply_status_change(&mut t, TicketStatus::Closed, Utc::now());
        assert_eq!(t.status, "closed");
    }

    #[test]
    fn internal_flag_downgraded_without_capability() {
        use crate::auth::CurrentUser;
        use crate::policy::capabilities;
        use crate::shared::models::Role;

        let t = ticket(TicketStatus::Open);

        let student = CurrentUser {
            id: t.student_id,
            role: Role::Student,
            department_id: None,
        };
        let staff = CurrentUser {
            id: Uuid::new_v4(),
            role: Role::Staff,
            department_id: Some(t.department_id),
        };
        let admin = CurrentUser {
            id: Uuid::new_v4(),
            role: Role::Admin,
            department_id: None,
        };

        // Owner student asking for an internal note gets a public response.
        let caps = capabilities(&student, &t);
        assert!(!effective_internal_flag(Some(true), &caps));
        assert!(!effective_internal_flag(None, &caps));

        // Staff in department and admins keep the flag they asked for.
        for actor in [&staff, &admin] {
            let caps = capabilities(actor, &t);
            assert!(effective_internal_flag(Some(true), &caps));
            assert!(!effective_internal_flag(Some(false), &caps));
            assert!(!effective_internal_flag(None, &caps));
        }
    }

    #[test]
    fn rating_bounds() {
        for r in 1..=5 {
            assert!(validate_rating(r).is_ok());
        }
        assert_eq!(validate_rating(0).unwrap_err().kind(), "validation");
        assert_eq!(validate_rating(6).unwrap_err().kind(), "validation");
        assert_eq!(validate_rating(-1).unwrap_err().kind(), "validation");
    }

    #[test]
    fn stats_over_fixture_of_ten() {
        // 4 open, 3 resolved rated [4, 5, 3], 2 in_progress, 1 closed.
        let mut rows: Vec<(String, String, Option<i32>)> = Vec::new();
        for _ in 0..4 {
            rows.push(("open".into(), "medium".into(), None));
        }
        for r in [4, 5, 3] {
            rows.push(("resolved".into(), "high".into(), Some(r)));
        }
        rows.push(("in_progress".into(), "low".into(), None));
        rows.push(("in_progress".into(), "urgent".into(), None));
        rows.push(("closed".into(), "medium".into(), None));

        let stats = TicketStats::from_rows(&rows);
        assert_eq!(stats.total, 10);
        assert_eq!(stats.by_status.open, 4);
        assert_eq!(stats.by_status.resolved, 3);
        assert_eq!(stats.by_status.in_progress, 2);
        assert_eq!(stats.by_status.closed, 1);
        assert_eq!(stats.priority.medium, 5);
        assert_eq!(stats.average_rating, Some(4.0));
    }

    #[test]
    fn unrated_or_unresolved_tickets_do_not_skew_average() {
        let rows = vec![
            ("resolved".to_string(), "low".to_string(), None),
            ("closed".to_string(), "low".to_string(), Some(1)),
        ];
        let stats = TicketStats::from_rows(&rows);
        assert_eq!(stats.average_rating, None);
    }
}
