use insider::{RoomServer, SessionConfig};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = SessionConfig::from_env();
    let artifact_path = config
        .persistence_dir
        .join(format!("{}.recording.json.gz", config.room.id));

    let server = match RoomServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    if let Ok(addr) = server.local_addr() {
        info!("listening on {addr}");
    }
    let session = server.session();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down, finalizing recording");
            match session.finalize().await {
                Ok(bytes) => match std::fs::write(&artifact_path, &bytes) {
                    Ok(()) => info!("recording written to {}", artifact_path.display()),
                    Err(e) => error!("failed to write recording: {e}"),
                },
                Err(e) => error!("finalize failed: {e}"),
            }
        }
    }
}
