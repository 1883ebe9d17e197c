use std::convert::Infallible;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{self, AuthenticatedUser};
use crate::broker::Topic;
use crate::corpus;
use crate::errors::{SubmitError, TransportError};
use crate::gateway::{NotificationGateway, HEARTBEAT_MESSAGE};
use crate::submission::{self, SubmitRequest, SubmitResponse};
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Accounts
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        // Corpora
        .route("/upload_corpus", post(corpus::upload_corpus))
        .route("/corpuses", get(corpus::list_corpuses))
        // Search tasks
        .route("/search_algorithm", post(submit_search))
        // Notification streams
        .route("/ws", get(ws_handler))
        .route("/events", get(sse_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn submit_search(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, SubmitError> {
    let response = submission::submit(&state.dispatcher, state.db.as_ref(), user.user_id, req)?;
    Ok(Json(response))
}

async fn ws_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> Response {
    let gateway = NotificationGateway::new(
        state.broker.clone(),
        user.user_id,
        state.config.gateway_settings(),
        state.shutdown.child_token(),
    );

    ws.on_upgrade(move |socket| async move {
        // Outcome is already logged by the gateway
        let _ = gateway.run(socket).await;
    })
}

/// Same per-user stream as `/ws`, for clients limited to Server-Sent Events.
async fn sse_handler(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, TransportError> {
    let subscription = state.broker.subscribe(&Topic::for_user(user.user_id))?;
    tracing::info!("New SSE connection for user {}", user.user_id);

    let shutdown = state.shutdown.child_token();
    let stream = stream::unfold(
        (subscription, shutdown),
        |(mut subscription, shutdown)| async move {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return None,
                next = subscription.recv() => next,
            };
            match next {
                Ok(message) => {
                    let event = Ok::<_, Infallible>(Event::default().data(message));
                    Some((event, (subscription, shutdown)))
                }
                Err(e) => {
                    tracing::debug!("SSE stream for {} ended: {}", subscription.topic(), e);
                    None
                }
            }
        },
    );

    let keep_alive = KeepAlive::new()
        .interval(state.config.heartbeat_interval)
        .text(HEARTBEAT_MESSAGE);
    Ok(Sse::new(stream).keep_alive(keep_alive))
}
