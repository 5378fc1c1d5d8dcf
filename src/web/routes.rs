use actix_web::web;
use crate::web::handlers;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ask", web::get().to(handlers::ask))
        .route("/ask-stream", web::get().to(handlers::ask_stream))
        .route("/", web::get().to(handlers::index))
        .route("/health", web::get().to(handlers::health_check));
}
