//! The single control screen and its routing shell.
//!
//! One screen at `/`; every other path redirects there. The screen binds
//! to the session snapshot and posts to `/toggle`; `/state` exposes the
//! same snapshot as JSON.

use crate::session::{SessionController, SessionSnapshot};
use axum::extract::State;
use axum::response::{Html, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub fn router(controller: Arc<SessionController>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/state", get(state))
        .route("/toggle", post(toggle))
        .fallback(redirect_to_root)
        .with_state(controller)
}

/// Serve the control screen until `shutdown` is cancelled.
pub async fn serve(
    controller: Arc<SessionController>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(controller);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("🌐 control screen at http://{addr}/");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn index(State(controller): State<Arc<SessionController>>) -> Html<String> {
    Html(render_screen(&controller.snapshot()))
}

async fn state(State(controller): State<Arc<SessionController>>) -> Json<SessionSnapshot> {
    Json(controller.snapshot())
}

async fn toggle(State(controller): State<Arc<SessionController>>) -> Redirect {
    controller.toggle_conversation().await;
    Redirect::to("/")
}

async fn redirect_to_root() -> Redirect {
    Redirect::to("/")
}

fn render_screen(snapshot: &SessionSnapshot) -> String {
    let status = if snapshot.is_listening {
        "Listening"
    } else if snapshot.is_connecting {
        "Connecting…"
    } else if snapshot.is_initialized {
        "Idle"
    } else {
        "Not initialized"
    };

    let button = if snapshot.is_listening || snapshot.is_connecting {
        "Stop conversation"
    } else {
        "Start conversation"
    };

    let error = if snapshot.error_message.is_empty() {
        String::new()
    } else {
        format!(
            "<p class=\"error\">{}</p>",
            escape_html(&snapshot.error_message)
        )
    };

    let disabled = if snapshot.is_initialized { "" } else { " disabled" };

    format!(
        "<!doctype html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Football Analyst</title>\n\
         <style>body{{font-family:sans-serif;max-width:32rem;margin:4rem auto}}\
         .error{{color:#b00020}}</style>\n</head>\n<body>\n\
         <h1>⚽ Football Analyst</h1>\n\
         <p>Status: <strong>{status}</strong></p>\n{error}\
         <form method=\"post\" action=\"/toggle\">\n\
         <button type=\"submit\"{disabled}>{button}</button>\n</form>\n\
         </body>\n</html>\n"
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
