//! Process entry point: loads configuration, installs the global
//! logger, wires up `AppState`, and serves the signaling WebSocket.

use std::sync::Arc;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use slog::info;

use confcore::app::AppState;
use confcore::conf;
use confcore::coordinator::SessionCoordinator;
use confcore::log;
use confcore::router::MockMediaRouter;

async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    app: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    ws::start(SessionCoordinator::new(app.get_ref().clone()), &req, stream)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let _guard = log::init();

    let conf = conf::load().unwrap_or_else(|err| {
        eprintln!("failed to load configuration: {}", err);
        std::process::exit(1);
    });
    let bind_addr = conf.server.bind_addr.clone();

    // The bundled binary runs against the deterministic in-memory router;
    // a real deployment supplies its own `Arc<dyn MediaRouter>` by
    // embedding this crate as a library instead of running this binary.
    let app_state = AppState::new(conf, Arc::new(MockMediaRouter::new()));

    info!(log::logger(), "starting confcore"; "bind_addr" => bind_addr.clone());

    // `HttpServer` installs its own SIGINT/SIGTERM handling and shuts
    // down gracefully on either, so no signal plumbing is needed here.
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .route("/ws", web::get().to(ws_index))
    })
    .bind(&bind_addr)?
    .run()
    .await
}
