mod actions;
mod config;
mod deliveries;
mod github_events;
mod handlers;
mod router;
mod routes;

pub use actions::ActionRegistry;
pub use config::FrontConfig;
pub use deliveries::DeliveryLog;
pub use handlers::AppState;
pub use router::EventRouter;
pub use routes::build_app;
