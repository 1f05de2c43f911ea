#[tokio::main]
async fn main() -> followup_bot::error::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("followup_bot=info,serenity=warn"),
    )
    .init();
    log::info!("Starting followup-bot Discord bot");

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("A rustls crypto provider was already installed");
    }

    match followup_bot::run().await {
        Ok(()) => {
            log::info!("Bot shut down successfully");
            Ok(())
        }
        Err(e) => {
            log::error!("Bot encountered an error: {e}");
            Err(e)
        }
    }
}
