use std::io;

use ruvltra_mcp::{McpServer, RuvltraConfig};
use tracing_subscriber::EnvFilter;

fn main() -> io::Result<()> {
    let config = RuvltraConfig::load();
    // The transport owns stdout; every diagnostic goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let server = McpServer::new(config);
    server.serve_stdio()
}
