//! HTTP endpoint handlers
//!
//! The chat handler composes the whole pipeline: validate, clamp, build
//! the LLM context (without writing the user turn -- history gains both
//! turns only after a successful response), run the retry controller
//! with tokens fanning out over SSE, then optionally kick off image
//! generation.
//!
//! Neither `/events` nor `/chat` carries a server write timeout: SSE
//! streams and model calls can run for minutes.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::{Extension, Form, Json};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::compute::{
    wire_seed, ErrorResponse, GenerateRequest, GenerateResponse, ERROR_RESPONSE, GENERATE_RESPONSE,
};
use crate::error::WeaveError;
use crate::images::encode_png;
use crate::llm::{ChatMessage, ChatOutcome, RetryController};
use crate::server::assets;
use crate::server::session_mw::SessionContext;
use crate::server::sse::SseEvent;
use crate::server::AppState;
use crate::session::PreviewStatus;

/// Form body for `/chat`.
#[derive(Debug, Deserialize)]
pub struct ChatForm {
    /// The user's message
    pub message: String,
    /// Optional steps override
    pub steps: Option<String>,
    /// Optional cfg override
    pub cfg: Option<String>,
    /// Optional seed override
    pub seed: Option<String>,
}

/// Form body for `/prompt`.
#[derive(Debug, Deserialize)]
pub struct PromptForm {
    /// The edited prompt
    pub prompt: String,
}

/// Form body for `/generate`.
#[derive(Debug, Deserialize)]
pub struct GenerateForm {
    /// Prompt override; falls back to the session's current prompt
    pub prompt: Option<String>,
    /// Optional steps override
    pub steps: Option<String>,
    /// Optional cfg override
    pub cfg: Option<String>,
    /// Optional seed override
    pub seed: Option<String>,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// GET `/` -- index page with default settings interpolated.
pub async fn index(State(state): State<AppState>) -> Html<String> {
    Html(assets::render_index(&state.config))
}

/// GET `/static/*file` -- embedded assets.
pub async fn static_file(Path(file): Path<String>) -> Response {
    match assets::static_asset(&file) {
        Some((body, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET `/ready` -- health probe for the desktop shell.
pub async fn ready() -> Json<serde_json::Value> {
    Json(json!({ "status": "ready" }))
}

/// GET `/events` -- the session's SSE stream.
///
/// Requires a presented session cookie (401 otherwise) and respects the
/// global connection cap (503 at capacity). Opening a second stream for
/// the same session ends the first.
pub async fn events(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Response {
    if ctx.issued {
        return json_error(StatusCode::UNAUTHORIZED, "session cookie required");
    }

    // Make sure the session exists so chat state survives reconnects.
    state.sessions.get_or_create(&ctx.id);

    let registration = match state.broker.register(&ctx.id) {
        Ok(registration) => registration,
        Err(e) => {
            tracing::warn!(session = %ctx.id, "sse registration refused: {}", e);
            return json_error(StatusCode::SERVICE_UNAVAILABLE, "too many connections");
        }
    };

    let crate::server::sse::Registration {
        events,
        done,
        guard,
    } = registration;

    let stream = events
        .map(|event| {
            Ok::<_, Infallible>(
                Event::default()
                    .event(event.event.clone())
                    .data(event.data.to_string()),
            )
        })
        .take_until(done.cancelled_owned())
        // The guard must live exactly as long as the stream: dropping
        // it runs the identity-checked registry cleanup.
        .map(move |item| {
            let _keep_alive = &guard;
            item
        });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// POST `/chat` -- one user turn through the retry controller.
pub async fn chat(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Form(form): Form<ChatForm>,
) -> Response {
    let message = form.message.trim().to_string();
    if message.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "message is required");
    }
    if message.len() > state.config.limits.max_message_bytes {
        return json_error(StatusCode::PAYLOAD_TOO_LARGE, "message too long");
    }

    if let Err(e) = state.chat_limiter.check(&ctx.id) {
        let _ = state
            .broker
            .send_to_session(&ctx.id, SseEvent::error(&e.user_message()));
        return json_error(StatusCode::TOO_MANY_REQUESTS, &e.user_message());
    }

    let session = state.sessions.get_or_create(&ctx.id);

    let clamp = crate::session::parse_and_clamp(
        form.steps.as_deref(),
        form.cfg.as_deref(),
        form.seed.as_deref(),
    );
    session.set_settings(clamp.settings);

    // Build the context without the new user message in history; it is
    // only written after the model answers, so failures cannot leave an
    // orphaned user turn to corrupt the next call's context.
    let mut outbound = session.with_conversation(|conversation| {
        conversation.notify_prompt_edited();
        conversation.build_llm_context(
            &state.config.server.system_prompt,
            clamp.settings.steps,
            clamp.settings.cfg,
            clamp.settings.seed,
        )
    });
    outbound.push(ChatMessage::user(message.clone()));

    let controller = RetryController::new(state.provider.clone());
    let broker = state.broker.clone();
    let token_session = ctx.id.clone();
    let on_token = move |token: &str| broker.send_to_session(&token_session, SseEvent::agent_token(token));
    let retry_broker = state.broker.clone();
    let retry_session = ctx.id.clone();
    let on_retry = move |attempt: usize, error: &crate::llm::FormatError| {
        retry_broker.send_to_session(
            &retry_session,
            SseEvent::agent_retry(attempt, &error.to_string()),
        )
    };

    let outcome = controller.run(&outbound, &on_token, &on_retry).await;

    match outcome {
        Ok(ChatOutcome::Success { text, metadata }) => {
            // Two-phase append: both turns land together, assistant
            // content is the conversational text only.
            let (assistant_id, current_prompt) = session.with_conversation(|conversation| {
                conversation.add_user_message(&message);
                let id =
                    conversation.add_assistant_message(&text, &metadata.prompt, Some(&metadata));
                (id, conversation.current_prompt().to_string())
            });

            let _ = state
                .broker
                .send_to_session(&ctx.id, SseEvent::prompt_update(&current_prompt));

            let (steps, cfg, seed) = clamp.settings.effective(
                state.config.server.default_steps,
                state.config.server.default_cfg,
            );
            let note = clamp.clamped().then(|| clamp.notes.join("; "));
            let _ = state.broker.send_to_session(
                &ctx.id,
                SseEvent::settings_update(steps, cfg, seed, note.as_deref()),
            );
            let _ = state
                .broker
                .send_to_session(&ctx.id, SseEvent::agent_done());

            if metadata.generate_image && !current_prompt.is_empty() {
                match state.generate_limiter.check(&ctx.id) {
                    Ok(()) => {
                        session.with_conversation(|conversation| {
                            conversation.update_message_preview(
                                assistant_id,
                                PreviewStatus::Generating,
                                "",
                            );
                        });
                        let state = state.clone();
                        let session_id = ctx.id.clone();
                        tokio::spawn(async move {
                            run_generation(
                                state,
                                session_id,
                                current_prompt,
                                steps,
                                cfg,
                                seed,
                                Some(assistant_id),
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        let _ = state
                            .broker
                            .send_to_session(&ctx.id, SseEvent::error(&e.user_message()));
                    }
                }
            }

            (
                StatusCode::OK,
                Json(json!({ "status": "ok", "session_id": ctx.id })),
            )
                .into_response()
        }
        Ok(ChatOutcome::Exhausted { last_error }) => {
            // Level 3: reset the conversation and tell the user. 200 so
            // the client-side form handling does not raise.
            tracing::error!(session = %ctx.id, error = %last_error, "chat recovery exhausted, resetting");
            session.with_conversation(|conversation| conversation.clear());
            let _ = state.broker.send_to_session(
                &ctx.id,
                SseEvent::error("The model kept answering in a broken format, so the conversation was reset. Please try again."),
            );
            let _ = state
                .broker
                .send_to_session(&ctx.id, SseEvent::agent_done());
            (
                StatusCode::OK,
                Json(json!({ "status": "reset", "session_id": ctx.id })),
            )
                .into_response()
        }
        Err(e) => {
            if let Some(WeaveError::StreamAborted(_) | WeaveError::Sse(_)) =
                e.downcast_ref::<WeaveError>()
            {
                // The event stream failed mid-call: the browser is gone
                // or hopelessly behind, and nobody is listening.
                tracing::info!(session = %ctx.id, "chat aborted: sse consumer unavailable: {}", e);
                return (
                    StatusCode::OK,
                    Json(json!({ "status": "aborted", "session_id": ctx.id })),
                )
                    .into_response();
            }

            tracing::error!(session = %ctx.id, "chat failed: {:#}", e);
            let user_message = e
                .downcast_ref::<WeaveError>()
                .map(WeaveError::user_message)
                .unwrap_or_else(|| "Something went wrong. Please try again.".to_string());
            let _ = state
                .broker
                .send_to_session(&ctx.id, SseEvent::error(&user_message));
            // Finalize the bubble even on failure so the UI does not
            // hang on a half-streamed message.
            let _ = state
                .broker
                .send_to_session(&ctx.id, SseEvent::agent_done());
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &user_message)
        }
    }
}

/// POST `/prompt` -- user edit of the generation prompt.
pub async fn prompt(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Form(form): Form<PromptForm>,
) -> Response {
    if form.prompt.len() > state.config.limits.max_prompt_bytes {
        return json_error(StatusCode::PAYLOAD_TOO_LARGE, "prompt too long");
    }

    let session = state.sessions.get_or_create(&ctx.id);
    let current = session.with_conversation(|conversation| {
        conversation.update_prompt(form.prompt.trim());
        conversation.current_prompt().to_string()
    });

    let _ = state
        .broker
        .send_to_session(&ctx.id, SseEvent::prompt_update(&current));

    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "session_id": ctx.id })),
    )
        .into_response()
}

/// POST `/new-chat` -- clear the session's conversation.
pub async fn new_chat(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Response {
    let session = state.sessions.get_or_create(&ctx.id);
    session.with_conversation(|conversation| conversation.clear());
    let _ = state
        .broker
        .send_to_session(&ctx.id, SseEvent::prompt_update(""));

    (
        StatusCode::OK,
        Json(json!({ "status": "cleared", "session_id": ctx.id })),
    )
        .into_response()
}

/// POST `/generate` -- manual image generation.
pub async fn generate(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Form(form): Form<GenerateForm>,
) -> Response {
    let session = state.sessions.get_or_create(&ctx.id);

    let prompt = match form.prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(prompt) => prompt.to_string(),
        None => session.with_conversation(|c| c.current_prompt().to_string()),
    };
    if prompt.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "no prompt to generate from");
    }
    if prompt.len() > state.config.limits.max_prompt_bytes {
        return json_error(StatusCode::PAYLOAD_TOO_LARGE, "prompt too long");
    }

    if let Err(e) = state.generate_limiter.check(&ctx.id) {
        let _ = state
            .broker
            .send_to_session(&ctx.id, SseEvent::error(&e.user_message()));
        return json_error(StatusCode::TOO_MANY_REQUESTS, &e.user_message());
    }

    if state.compute_mux().is_none() {
        let _ = state.broker.send_to_session(
            &ctx.id,
            SseEvent::error("The image worker is not available."),
        );
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "image worker unavailable");
    }

    let clamp = crate::session::parse_and_clamp(
        form.steps.as_deref(),
        form.cfg.as_deref(),
        form.seed.as_deref(),
    );
    let stored = session.settings().unwrap_or_default();
    let merged = if clamp.settings.is_customized() {
        session.set_settings(clamp.settings);
        clamp.settings
    } else {
        stored
    };
    let (steps, cfg, seed) = merged.effective(
        state.config.server.default_steps,
        state.config.server.default_cfg,
    );

    match generate_image(&state, &ctx.id, &prompt, steps, cfg, seed, None).await {
        Ok(image_url) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "session_id": ctx.id, "url": image_url })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(session = %ctx.id, "manual generation failed: {:#}", e);
            let user_message = e
                .downcast_ref::<WeaveError>()
                .map(WeaveError::user_message)
                .unwrap_or_else(|| "Image generation failed.".to_string());
            let _ = state
                .broker
                .send_to_session(&ctx.id, SseEvent::error(&user_message));
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &user_message)
        }
    }
}

/// GET `/images/{id}[.png]` -- serve a generated PNG.
pub async fn image(State(state): State<AppState>, Path(raw_id): Path<String>) -> Response {
    let id = raw_id.strip_suffix(".png").unwrap_or(&raw_id);
    if Uuid::parse_str(id).is_err() {
        return json_error(StatusCode::BAD_REQUEST, "malformed image id");
    }

    match state.images.get(id) {
        Some(stored) => (
            [
                (header::CONTENT_TYPE, "image/png".to_string()),
                (
                    header::CACHE_CONTROL,
                    "public, max-age=31536000, immutable".to_string(),
                ),
            ],
            stored.png.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Background wrapper around [`generate_image`] used by auto-generate:
/// failures become SSE error events and roll the preview status back.
pub(crate) async fn run_generation(
    state: AppState,
    session_id: String,
    prompt: String,
    steps: u32,
    cfg: f32,
    seed: i64,
    message_id: Option<u64>,
) {
    if let Err(e) = generate_image(&state, &session_id, &prompt, steps, cfg, seed, message_id).await
    {
        tracing::error!(session = %session_id, "generation failed: {:#}", e);
        let user_message = e
            .downcast_ref::<WeaveError>()
            .map(WeaveError::user_message)
            .unwrap_or_else(|| "Image generation failed.".to_string());
        let _ = state
            .broker
            .send_to_session(&session_id, SseEvent::error(&user_message));
        if let (Some(id), Some(session)) = (message_id, state.sessions.get(&session_id)) {
            session.with_conversation(|conversation| {
                conversation.update_message_preview(id, PreviewStatus::None, "");
            });
        }
    }
}

/// Submits one generate request to the worker and publishes the result.
///
/// Emits `generation-started` before the request and `image-ready` with
/// the stored image's URL on success. `message_id`, when given, names
/// the assistant message whose snapshot tracks this generation.
async fn generate_image(
    state: &AppState,
    session_id: &str,
    prompt: &str,
    steps: u32,
    cfg: f32,
    seed: i64,
    message_id: Option<u64>,
) -> crate::error::Result<String> {
    let mux = state.compute_mux().ok_or(WeaveError::ReaderDead)?;

    let _ = state
        .broker
        .send_to_session(session_id, SseEvent::generation_started(prompt));

    let request = GenerateRequest {
        request_id: mux.next_request_id(),
        prompt: prompt.to_string(),
        width: state.config.server.image_width,
        height: state.config.server.image_height,
        steps,
        cfg_scale: cfg,
        seed: wire_seed(seed),
    };
    tracing::info!(
        session = %session_id,
        request_id = request.request_id,
        steps,
        cfg,
        seed,
        "submitting generate request"
    );

    let deadline = std::time::Duration::from_secs(state.config.compute.generate_timeout_secs);
    let reply = mux.send(request.into_frame(), deadline).await?;

    match reply.message_type {
        GENERATE_RESPONSE => {
            let response = GenerateResponse::from_frame(&reply)?;
            let png = encode_png(
                response.width,
                response.height,
                response.channels,
                &response.pixels,
            )?;
            let stored = state.images.insert(png, response.width, response.height);
            let url = format!("/images/{}.png", stored.id);

            if let (Some(id), Some(session)) = (message_id, state.sessions.get(session_id)) {
                session.with_conversation(|conversation| {
                    conversation.update_message_preview(id, PreviewStatus::Complete, &url);
                });
            }

            let _ = state.broker.send_to_session(
                session_id,
                SseEvent::image_ready(&url, response.width, response.height),
            );
            Ok(url)
        }
        ERROR_RESPONSE => {
            let error = ErrorResponse::from_frame(&reply)?;
            Err(WeaveError::WorkerReported {
                code: error.code,
                message: error.message,
            }
            .into())
        }
        other => Err(WeaveError::Internal(format!(
            "unexpected message type {} from worker",
            other
        ))
        .into()),
    }
}
