pub mod config;
pub mod extract;
pub mod marker;
pub mod messaging;
pub mod models;
pub mod page;
pub mod pipeline;
pub mod relay;
pub mod render;
pub mod server;
pub mod theme;
