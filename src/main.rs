mod config;
mod memory;
mod model;
mod relay;
mod web;

use actix_web::{App, HttpServer, web::Data};
use actix_files as fs;
use dotenv::dotenv;
use log::{info, error};
use std::sync::Arc;
use tera::Tera;

use config::Config;
use memory::ConversationStore;
use model::OllamaModel;
use relay::RelayService;
use web::routes;

// App state structure
struct AppState {
    tera: Tera,
    relay: RelayService,
    model_name: String,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting ask relay");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let model = match OllamaModel::from_config(&config) {
        Ok(model) => model,
        Err(e) => {
            error!("Failed to initialize Ollama client: {:#}", e);
            std::process::exit(1);
        }
    };

    // History lives as long as the server; each conversation keeps a fixed window
    let store = Arc::new(ConversationStore::new(config.history_capacity));
    info!("Conversation window: {} messages", store.capacity());

    let relay = RelayService::new(
        store,
        Arc::new(model),
        config.max_concurrent_generations,
        config.stream_buffer,
    );
    info!("Default conversation id: {}", relay.default_conversation());

    // Initialize template engine
    let mut tera = match Tera::new("templates/**/*") {
        Ok(t) => t,
        Err(e) => {
            error!("Template parsing error: {}", e);
            std::process::exit(1);
        }
    };
    tera.autoescape_on(vec![".html"]);

    let app_state = Data::new(AppState {
        tera,
        relay,
        model_name: config.ollama_model.clone(),
    });

    info!("Listening on {}:{}", config.bind_addr, config.port);
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
            .service(fs::Files::new("/static", "./static"))
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await
}
