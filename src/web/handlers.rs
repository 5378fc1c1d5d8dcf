use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder, ResponseError};
use futures::StreamExt;
use log::{error, info};
use serde_json::json;
use tera::Context;

use crate::model::ModelError;
use crate::relay::RelayError;
use crate::web::models::{AskQuery, ErrorBody};
use crate::AppState;

pub const CONVERSATION_HEADER: &str = "X-Conversation-Id";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

impl ResponseError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Model(ModelError::Backend(_)) => StatusCode::BAD_GATEWAY,
            RelayError::Model(ModelError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::WorkerUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::InvalidConversationId(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}

// Index page handler
pub async fn index(data: web::Data<AppState>) -> impl Responder {
    let mut context = Context::new();
    context.insert("model", &data.model_name);
    match data.tera.render("index.html", &context) {
        Ok(html) => HttpResponse::Ok().content_type("text/html").body(html),
        Err(e) => {
            error!("Template error: {}", e);
            HttpResponse::InternalServerError().body("Template error")
        }
    }
}

// Health check endpoint
pub async fn health_check(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "conversations": data.relay.store().conversation_count(),
    }))
}

/// GET /ask?question=... -- single answer, no history.
pub async fn ask(data: web::Data<AppState>, query: web::Query<AskQuery>) -> Result<HttpResponse, RelayError> {
    info!("Ask request: {}", query.question);
    let answer = data.relay.ask(&query.question).await.map_err(|e| {
        error!("Model error: {}", e);
        e
    })?;
    Ok(HttpResponse::Ok().content_type(TEXT_PLAIN).body(answer))
}

/// GET /ask-stream?question=... -- chunked answer, recorded in the conversation.
pub async fn ask_stream(
    data: web::Data<AppState>,
    query: web::Query<AskQuery>,
) -> Result<HttpResponse, RelayError> {
    let AskQuery { question, conversation_id } = query.into_inner();
    // checked before anything is stored or sent to the backend
    let conversation_id = data.relay.conversation_id(conversation_id.as_deref())?;
    info!("Stream request in conversation {}: {}", conversation_id, question);

    let fragments = data.relay.ask_stream(&conversation_id, &question).await.map_err(|e| {
        error!("Model error: {}", e);
        e
    })?;
    // an Err item aborts the chunked body after whatever was already sent
    let body = fragments.map(|fragment| fragment.map(web::Bytes::from));

    Ok(HttpResponse::Ok()
        .content_type(TEXT_PLAIN)
        .insert_header((CONVERSATION_HEADER, conversation_id))
        .streaming(body))
}
