//! Fuzzy word-search server.
//!
//! Clients submit a search over a stored corpus and get a task id back at
//! once; the search runs on a background worker pool and its lifecycle
//! (STARTED, PROGRESS, COMPLETED or FAILED) is pushed to the owner over a
//! WebSocket or SSE stream fed from a per-user broker topic.

pub mod api;
pub mod auth;
pub mod broker;
pub mod config;
pub mod corpus;
pub mod cron;
pub mod db;
pub mod dispatcher;
pub mod distance;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod submission;
pub mod worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use auth::AuthGate;
use broker::Broker;
use config::Config;
use db::Database;
use dispatcher::TaskDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub auth: AuthGate,
    pub broker: Arc<dyn Broker>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub config: Arc<Config>,
    /// Fires when the server is going down; gateways stop on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(db: Arc<Database>, broker: Arc<dyn Broker>, config: Config) -> Self {
        let dispatcher = TaskDispatcher::new(Arc::clone(&broker), config.pool_settings());
        Self {
            auth: AuthGate::new(db.clone()),
            db,
            broker,
            dispatcher: Arc::new(dispatcher),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}
