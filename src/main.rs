use log::{error, info};

use room_relay::integration::{self, Config};
use room_relay::room::service::run_retention;
use room_relay::state::AppState;

#[tokio::main]
async fn main() {
    integration::init_logger();

    let cfg = Config::default();
    let state = match AppState::init(&cfg).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to initialize application state: {e}");
            std::process::exit(1);
        }
    };

    tokio::spawn(run_retention(
        state.room_service.clone(),
        cfg.room.clone(),
    ));

    let app = room_relay::router(state, &cfg.env);
    let addr = cfg.env.addr();

    let served = match cfg.env.ssl_config() {
        Some(tls) => {
            info!("listening on https://{addr}");
            axum_server::bind_openssl(addr, tls)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!("listening on http://{addr}");
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await
        }
    };

    if let Err(e) = served {
        error!("server stopped: {e}");
    }
}
