use clap::Parser;
use std::sync::Arc;

use tmind_broker::{gateway, MqttPublisher, Settings};
use tmind_radio::GattCliRadio;
use tmindd::{init_logging, shutdown_signal, Cli, TagMinderResult};

#[actix::main]
async fn main() -> TagMinderResult<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_deref(), cli.log_level)?;

    let settings = Settings::from_path(&cli.config).map_err(|e| {
        log::error!("Unable to load config {}: {e:}", cli.config.display());
        e
    })?;
    let settings = Arc::new(settings);
    log::info!(
        "Starting tag-minder as {} on {}, watching {} devices",
        settings.publisher_id,
        settings.adapter,
        settings.known_devices.len()
    );

    let radio = Arc::new(GattCliRadio::new(settings.adapter.clone()));
    let publisher = Arc::new(MqttPublisher::new(&settings.broker));

    let gw = gateway(settings, radio, publisher.clone());

    shutdown_signal().await?;

    gw.shutdown().await?;
    publisher.disconnect().await;

    Ok(())
}
