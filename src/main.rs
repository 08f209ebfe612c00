//! Licensed HTTP proxy gateway binary entry point.

use havuz_gateway::{config, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    config::init()?;
    let cfg = config::get().clone();

    if let Err(e) = Server::new(cfg).run().await {
        log::error!("gateway exited: {e}");
        return Err(e.into());
    }

    Ok(())
}
