use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use chrono::Utc;
use diesel::prelude::*;
use dotenvy::dotenv;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod auth;
mod channels;
mod config;
mod policy;
mod realtime;
mod shared;
mod tickets;

use crate::auth::configure_auth_routes;
use crate::channels::whatsapp::configure_whatsapp_routes;
use crate::config::AppConfig;
use crate::realtime::configure_realtime_routes;
use crate::shared::models::{Department, TicketCategory};
use crate::shared::schema::{departments, ticket_categories};
use crate::shared::state::AppState;
use crate::shared::utils::{create_conn, run_migrations, DbPool};
use crate::tickets::configure_tickets_routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("deskserver=info,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env();
    let pool = create_conn(&config.database_url())?;
    run_migrations(&pool)?;
    if config.seed_data {
        seed_baseline(&pool)?;
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = Arc::new(AppState::new(pool, config));

    let app = Router::new()
        .merge(configure_auth_routes())
        .merge(configure_tickets_routes())
        .merge(configure_realtime_routes())
        .merge(configure_whatsapp_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "deskserver listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Upserts the baseline departments and categories so a fresh install has
/// something to file tickets against. Idempotent; gated by DESKSERVER_SEED.
fn seed_baseline(pool: &DbPool) -> anyhow::Result<()> {
    let mut conn = pool.get()?;

    for name in ["Computer Science", "Mathematics", "Physics", "Chemistry"] {
        let dept = Department {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            is_active: true,
            created_at: Utc::now(),
        };
        diesel::insert_into(departments::table)
            .values(&dept)
            .on_conflict(departments::name)
            .do_nothing()
            .execute(&mut conn)?;
    }

    for name in ["Exam", "Fees", "Hostel", "Library"] {
        let category = TicketCategory {
            id: Uuid::new_v4(),
            name: name.to_string(),
            icon: "📋".to_string(),
            color: "#007bff".to_string(),
            description: None,
            is_active: true,
            created_at: Utc::now(),
        };
        diesel::insert_into(ticket_categories::table)
            .values(&category)
            .on_conflict(ticket_categories::name)
            .do_nothing()
            .execute(&mut conn)?;
    }

    tracing::info!("baseline departments and categories seeded");
    Ok(())
}
