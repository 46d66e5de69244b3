mod app;
mod messages;

pub use app::add_routes;
