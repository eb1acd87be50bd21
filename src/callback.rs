//! The OAuth redirect endpoint the platform sends channel owners back to.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{AuthSessions, TokenVault};

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    state: Option<String>,
    code: Option<String>,
    #[allow(dead_code)]
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

pub struct CallbackState {
    pub sessions: Arc<AuthSessions>,
    pub vault: Arc<TokenVault>,
}

pub fn router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .route("/platform-callback", get(platform_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<CallbackState>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Callback server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn page(text: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><body><p>{text}</p></body></html>"
    ))
}

async fn platform_callback(
    State(state): State<Arc<CallbackState>>,
    Query(query): Query<CallbackQuery>,
) -> Html<String> {
    // Denials and platform errors clear the session either way; aborting
    // an already-expired session is a no-op.
    if let Some(error) = &query.error {
        if let Some(state_token) = &query.state {
            if let Err(err) = state.sessions.abort(state_token).await {
                warn!(error = %err, "Session abort failed");
            }
        }
        if error == "access_denied" {
            info!("Authorization cancelled by the user");
            return page("Authorization cancelled — nothing was changed. You can close this window.");
        }
        // The raw error is deliberately shown here so the channel owner
        // can pass it on for support triage.
        let description = query.error_description.as_deref().unwrap_or("no description");
        warn!(error = %error, description, "Authorization callback reported an error");
        return page(&format!(
            "Authorization failed ({error}: {description}). Please try again, \
             and pass this message on if the problem persists."
        ));
    }

    let (Some(state_token), Some(code)) = (&query.state, &query.code) else {
        return page("Missing callback parameters.");
    };

    let (channel, _guild_id) = match state.sessions.complete(state_token).await {
        Ok(session) => session,
        Err(_) => {
            // Consumed, expired, or never existed: one generic answer,
            // nothing about which of the three it was.
            return page(
                "This authorization is not active. It may have expired — \
                 request a new authorization link and try again.",
            );
        }
    };

    match state.vault.exchange_authorization_code(&channel, code).await {
        Ok(_) => page(&format!(
            "All set! {channel} is now authorized. You can close this window."
        )),
        Err(err) => {
            error!(channel = %channel, error = %err, "Code exchange failed");
            page("Something went wrong while completing the authorization. Please try again.")
        }
    }
}
