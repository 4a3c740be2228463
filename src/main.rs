// src/main.rs

mod admin;
mod app_state;
mod auth;
mod config;
mod contracts;
mod db;
mod disputes;
mod error;
mod escrow;
mod hire_requests;
mod messages;
mod models;
mod notification_hub;
mod notifications;
mod payment_log;
mod payments;
mod projects;
mod proposals;
mod reviews;
mod stripe;
mod support;
mod users;
mod web_socket_server;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{http, middleware::Logger, web, App, HttpServer};
use env_logger::Env;
use log::info;

use crate::app_state::AppState;
use crate::auth::Authentication;
use crate::notification_hub::NotificationHub;
use crate::stripe::StripeClient;
use crate::web_socket_server::ws_index;

fn api_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/auth")
            .route("/register", web::post().to(auth::register))
            .route("/login", web::post().to(auth::login))
            .route("/me", web::get().to(auth::me)),
    )
    // USERS
    .service(
        web::scope("/users")
            .route("/me", web::get().to(users::get_me))
            .route("/me/profile", web::put().to(users::update_profile))
            .route("/me/onboarding", web::put().to(users::update_onboarding))
            .route("/freelancers", web::get().to(users::search_freelancers))
            .route("/slug/{slug}", web::get().to(users::get_by_slug))
            .route("/{id}", web::get().to(users::get_user_by_id))
            .route("/{id}/reviews", web::get().to(reviews::user_reviews)),
    )
    // PROJECTS and the proposals submitted against them
    .service(
        web::scope("/projects")
            .route("", web::post().to(projects::create_project))
            .route("", web::get().to(projects::list_projects))
            .route("/mine", web::get().to(projects::my_projects))
            .route("/{id}", web::get().to(projects::get_project))
            .route("/{id}", web::put().to(projects::update_project))
            .route("/{id}", web::delete().to(projects::delete_project))
            .route("/{id}/status", web::patch().to(projects::update_project_status))
            .route("/{id}/proposals", web::post().to(proposals::submit_proposal))
            .route("/{id}/proposals", web::get().to(proposals::list_project_proposals)),
    )
    .service(
        web::scope("/proposals")
            .route("/mine", web::get().to(proposals::my_proposals))
            .route("/{id}/withdraw", web::patch().to(proposals::withdraw_proposal))
            .route("/{id}/accept", web::post().to(proposals::accept_proposal))
            .route("/{id}/reject", web::post().to(proposals::reject_proposal)),
    )
    // CONTRACTS
    .service(
        web::scope("/contracts")
            .route("", web::get().to(contracts::my_contracts))
            .route("/{id}", web::get().to(contracts::get_contract))
            .route("/{id}/cancel", web::post().to(contracts::cancel_contract))
            .route("/{id}/reviews", web::post().to(reviews::create_review))
            .service(
                web::scope("/{id}/milestones")
                    .route("", web::post().to(contracts::add_milestone))
                    .route("/{milestone_id}/submit", web::post().to(contracts::submit_milestone))
                    .route("/{milestone_id}/approve", web::post().to(contracts::approve_milestone))
                    .route("/{milestone_id}/reject", web::post().to(contracts::reject_milestone)),
            ),
    )
    // PAYMENTS
    .service(
        web::scope("/payments")
            .route("/fund", web::post().to(payments::fund_milestone))
            .route("/mine", web::get().to(payments::my_payments))
            .route("/{id}/confirm", web::post().to(payments::confirm_payment))
            .route("/{id}/release", web::post().to(payments::release_payment)),
    )
    // MESSAGING
    .service(
        web::scope("/conversations")
            .route("", web::post().to(messages::start_conversation))
            .route("", web::get().to(messages::list_conversations))
            .route("/{id}/messages", web::get().to(messages::get_messages))
            .route("/{id}/messages", web::post().to(messages::send_message)),
    )
    .service(
        web::scope("/notifications")
            .route("", web::get().to(notifications::list_notifications))
            .route("/unread-count", web::get().to(notifications::unread_count))
            .route("/read-all", web::patch().to(notifications::mark_all_read))
            .route("/{id}/read", web::patch().to(notifications::mark_read)),
    )
    .service(
        web::scope("/disputes")
            .route("", web::post().to(disputes::open_dispute))
            .route("", web::get().to(disputes::list_disputes))
            .route("/{id}", web::get().to(disputes::get_dispute)),
    )
    .service(
        web::scope("/hire-requests")
            .route("", web::post().to(hire_requests::create_hire_request))
            .route("", web::get().to(hire_requests::my_hire_requests))
            .route("/{id}/accept", web::post().to(hire_requests::accept_hire_request))
            .route("/{id}/decline", web::post().to(hire_requests::decline_hire_request))
            .route("/{id}/cancel", web::post().to(hire_requests::cancel_hire_request)),
    )
    .service(
        web::scope("/support/tickets")
            .route("", web::post().to(support::create_ticket))
            .route("", web::get().to(support::my_tickets))
            .route("/{id}", web::get().to(support::get_ticket))
            .route("/{id}/messages", web::post().to(support::reply_to_ticket)),
    )
    .route("/settings/public", web::get().to(admin::public_settings))
    // ADMIN
    .service(
        web::scope("/admin")
            .route("/settings", web::get().to(admin::get_settings))
            .route("/settings", web::put().to(admin::update_settings))
            .route("/stats", web::get().to(admin::stats))
            .route("/users", web::get().to(admin::list_users))
            .route("/users/{id}/status", web::patch().to(admin::update_user_status))
            .route("/payments", web::get().to(payments::list_transactions))
            .route("/payments/auto-release", web::post().to(payments::trigger_auto_release))
            .route("/payments/{id}/refund", web::post().to(payments::refund_payment))
            .route("/disputes/{id}", web::patch().to(disputes::update_dispute))
            .route("/support/tickets", web::get().to(support::list_all_tickets))
            .route("/support/tickets/{id}/status", web::patch().to(support::update_ticket_status)),
    );
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = config::Config::from_env();
    let mongodb = db::MongoDB::init(&config.mongo_uri, &config.database_name)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("MongoDB init failed: {e}")))?;
    let mongodb = Arc::new(mongodb);
    let notification_hub = NotificationHub::new().start();
    let stripe = Arc::new(StripeClient::new(&config.stripe_api_base, &config.stripe_secret_key));

    let state = AppState {
        notification_hub,
        mongodb,
        stripe,
        config: config.clone(),
    };
    escrow::spawn_auto_release(
        state.clone(),
        Duration::from_secs(config.escrow_release_interval_secs),
    );

    info!("Server running at http://{}", config.bind_addr);
    info!("Allowed CORS Origin: {}", config.frontend_origin);

    let frontend_origin = config.frontend_origin.clone();
    let jwt_secret = config.jwt_secret.clone();
    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Authentication::new(jwt_secret.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .app_data(error::json_config())
            .app_data(error::query_config())
            .app_data(error::path_config())
            .service(web::scope("/api/v1").configure(api_routes))
            // WEBSOCKET route for real-time
            .service(web::resource("/ws").route(web::get().to(ws_index)))
    })
    .bind(&config.bind_addr)?
    .run()
    .await
}
