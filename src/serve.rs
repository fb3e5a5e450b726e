// LatticeDB HTTP server
//
// Serves `GET /health` and `POST /query` on `LATTICEDB_PORT`.

use latticedb::{api, Config, Engine, VERSION};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let config = Config::from_env();
    let port = config.port;
    tracing::info!("LatticeDB server {} starting", VERSION);

    let engine = match Engine::open(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("cannot open database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = api::serve(engine.clone(), port).await {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = engine.close() {
        eprintln!("shutdown checkpoint failed: {}", e);
        std::process::exit(1);
    }
}
