use std::sync::Arc;

use axum::{body::Bytes, extract::State, response::IntoResponse};
use http::{HeaderMap, StatusCode};
use serde_json::from_slice;
use tracing::{Span, field::Empty, info, instrument, warn};

use crate::{
    app_error::AppError,
    check_run::CiJob,
    front::{
        github_events::{GithubEvent, WebhookCommonFields},
        handlers::AppState,
        router::Outcome,
    },
    github_client::GithubClient,
    github_token::TokenFetcher,
    github_verifier::GithubRequestVerifier,
};

#[instrument(
    skip_all,
    fields(
        delivery_id = Empty,
        event_name = Empty,
        action = Empty,
        owner = Empty,
        repo = Empty
    )
)]
pub async fn webhook<GH, F, J, V>(
    headers: HeaderMap,
    State(state): State<Arc<AppState<GH, F, J>>>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError>
where
    GH: GithubClient + 'static,
    F: TokenFetcher,
    J: CiJob + 'static,
    V: GithubRequestVerifier,
{
    let event_name = get_header_str(&headers, "x-github-event")?;
    Span::current().record("event_name", event_name);
    let delivery_id = get_header_str(&headers, "x-github-delivery")?;
    Span::current().record("delivery_id", delivery_id);

    let common = from_slice::<WebhookCommonFields>(&body)
        .map_err(|e| AppError::Validation(format!("malformed payload: {e}")))?;
    let action = common.action.as_deref().unwrap_or_default();
    Span::current().record("action", action);
    if let Some(repo) = &common.repository {
        Span::current().record("owner", repo.owner());
        Span::current().record("repo", repo.name.as_str());
        // Checked before the signature, the name ends up in API paths.
        if !repo.has_valid_name() {
            return Err(AppError::Validation(format!(
                "invalid repository name: {:?}",
                repo.name
            )));
        }
    }

    // Verify the raw bytes, re-serialized JSON would not match.
    if let Err(e) = V::verify_request(&headers, &body, &state.config.webhook_secret) {
        warn!("Request verification failed: {e}");
        return Err(AppError::Authentication);
    }

    if event_name == "ping" {
        return Ok((StatusCode::OK, "pong".to_owned()));
    }
    if !state.deliveries.first_seen(delivery_id).await {
        info!("duplicate delivery");
        return Ok((
            StatusCode::OK,
            format!("Duplicate delivery, skipping: {delivery_id}"),
        ));
    }

    let event = match GithubEvent::parse(event_name, action, &body) {
        Ok(Some(event)) => event,
        Ok(None) => {
            info!("unsupported event");
            return Ok((
                StatusCode::OK,
                format!("Unsupported event, skipping: {event_name}.{action}"),
            ));
        }
        Err(e) => {
            state.deliveries.forget(delivery_id).await;
            return Err(AppError::Validation(format!("{e:#}")));
        }
    };

    match state.router.dispatch(event, delivery_id).await {
        Ok(Outcome::Handled) => Ok((StatusCode::OK, "ok".to_owned())),
        Ok(Outcome::Ignored(reason)) => Ok((StatusCode::OK, reason)),
        Err(e) => {
            // Let GitHub redeliver it.
            state.deliveries.forget(delivery_id).await;
            Err(AppError::from_handler_error(e))
        }
    }
}

fn get_header_str<'hdr>(headers: &'hdr HeaderMap, key: &str) -> Result<&'hdr str, AppError> {
    headers
        .get(key)
        .ok_or_else(|| AppError::Validation(format!("missing {key} header field")))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("invalid {key} header field")))
}
