pub mod config;
pub mod protocol;
pub mod server;
pub mod tools;

pub use config::RuvltraConfig;
pub use server::McpServer;
