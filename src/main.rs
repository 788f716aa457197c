use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod databases;
mod dispatch;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod testutil;
mod timer;
mod utils;

use databases::mongo::MongoDb;
use dispatch::{ChangeStreamWatcher, PollWatcher, SubscriberHub};
use models::event::MongoEventStore;
use models::session::MongoSessionStore;
use state::AppState;
use timer::{TimerRegistry, TimerSettings};

const POLL_WATCHER_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quizblitz_live_service=info,tower_http=info".into()),
        )
        .init();

    MongoDb::init().await;
    let db = &MongoDb::get_instance().db;

    let session_store = MongoSessionStore::new(db);
    if let Err(e) = session_store.ensure_indexes().await {
        warn!(error = %e, "could not ensure session indexes");
    }
    let event_store = MongoEventStore::new(db);
    let event_collection = event_store.collection();

    let state = Arc::new(AppState {
        sessions: Arc::new(session_store),
        events: Arc::new(event_store),
        hub: SubscriberHub::default(),
        timers: TimerRegistry::default(),
        timer_settings: TimerSettings::default(),
    });

    // Store-change feed for push delivery: native change streams by default,
    // interval re-polling where the deployment cannot provide them.
    let watcher_mode =
        std::env::var("QUIZ_WATCHER").unwrap_or_else(|_| "change_stream".to_string());
    if watcher_mode == "poll" {
        let watcher = PollWatcher::new(event_collection, POLL_WATCHER_INTERVAL);
        tokio::spawn(dispatch::run_dispatcher(state.clone(), watcher));
        info!("dispatcher using interval polling");
    } else {
        match ChangeStreamWatcher::open(event_collection.clone()).await {
            Ok(watcher) => {
                tokio::spawn(dispatch::run_dispatcher(state.clone(), watcher));
                info!("dispatcher using change streams");
            }
            Err(e) => {
                warn!(error = %e, "change streams unavailable; falling back to polling");
                let watcher = PollWatcher::new(event_collection, POLL_WATCHER_INTERVAL);
                tokio::spawn(dispatch::run_dispatcher(state.clone(), watcher));
            }
        }
    }

    let app = routes::router(state).layer(CorsLayer::permissive());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(%addr, "listening");
    axum::serve(listener, app.into_make_service())
        .await
        .expect("server error");
}
