use jmp_client::{ClientConfig, JmpConnection, JmpMessage};
use tokio::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("JMP client v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;

    let connection = JmpConnection::with_config(&config);

    connection.add_connection_listener(|event| {
        info!("connection event: connected = {}", event.connected);
    });
    connection.add_auth_listener(|event| {
        info!(
            "auth event: authorized = {}, nonce = {:?}",
            event.authorized, event.nonce
        );
    });
    connection.add_message_listener(|message| {
        info!("message event: {:?}", message.message());
    });

    if !connection.connect().await? {
        anyhow::bail!("unable to connect to {}", connection.host_info());
    }

    // connect does not block on the login; that happens asynchronously
    info!("is authenticated: {}", connection.is_authenticated());

    let authenticated = connection
        .wait_for_authentication_timeout(Duration::from_millis(config.timeouts.auth_wait_ms))
        .await;
    info!("is authenticated: {}", authenticated);

    // ask the device to identify itself
    connection
        .send(&JmpMessage::registry_read(&[
            "$Model",
            "$SerialNumber",
            "$Version",
        ]))
        .await;

    tokio::time::sleep(Duration::from_secs(5)).await;

    connection.close().await;
    info!("done");

    Ok(())
}

fn load_config() -> anyhow::Result<ClientConfig> {
    // Try configs/client.toml (development)
    if let Ok(config) = ClientConfig::from_file("configs/client.toml") {
        info!("Loaded config from configs/client.toml");
        return Ok(config);
    }

    // Try ./jmp.toml (current directory)
    if let Ok(config) = ClientConfig::from_file("jmp.toml") {
        info!("Loaded config from jmp.toml");
        return Ok(config);
    }

    warn!("No config file found, using default configuration");
    Ok(ClientConfig::default_config())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
