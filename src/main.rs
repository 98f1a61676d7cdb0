use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use open_voice::audio::decoder;
use open_voice::{
    ChannelTransport, Config, GuildId, PlaybackDriver, QueueItem, SessionRegistry,
    StreamError, TransportProvider, UserId, VoiceTransport,
};

/// Proveedor de transporte local: siempre entrega la misma conexión.
struct LocalProvider {
    transport: Arc<ChannelTransport>,
}

#[async_trait::async_trait]
impl TransportProvider for LocalProvider {
    async fn acquire(&self, _guild_id: GuildId) -> Result<Arc<dyn VoiceTransport>, StreamError> {
        Ok(self.transport.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_voice=debug".parse()?),
        )
        .init();

    info!("🎧 Iniciando Open Voice v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        decoder::verify_dependencies(&config).await?;
        println!("OK");
        return Ok(());
    }

    let locators: Vec<String> = std::env::args().skip(1).collect();
    if locators.is_empty() {
        anyhow::bail!("uso: open-voice <locator> [locator...]");
    }

    info!("{}", config.summary());
    decoder::verify_dependencies(&config).await?;

    let config = Arc::new(config);
    let registry = Arc::new(SessionRegistry::new());
    let driver = PlaybackDriver::new(config.clone(), registry.clone());
    let (_reaper, reaper_cancel) = registry.spawn_idle_reaper(config.clone());

    // Transporte local: una tarea drena un frame cada 20ms, igual que lo
    // haría la conexión de voz real.
    let (transport, frames) = ChannelTransport::new(64);
    let pacer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            if matches!(frames.try_recv(), Err(flume::TryRecvError::Disconnected)) {
                break;
            }
        }
    });

    // Manejar shutdown graceful
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Error al registrar Ctrl+C");
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        std::process::exit(0);
    });

    // Encolar todos los locators en el mismo guild de demostración
    let guild_id = GuildId(1);
    let provider = LocalProvider {
        transport: transport.clone(),
    };

    for (n, locator) in locators.iter().enumerate() {
        let item = QueueItem::new(locator, format!("Pista {}", n + 1), UserId(0));
        driver.enqueue(guild_id, item, &provider).await?;
    }

    // Esperar a que la cola termine
    let session = registry.get_or_create(guild_id);
    let started = Instant::now();
    while session.is_playing() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    reaper_cancel.cancel();
    pacer.abort();

    let elapsed = Duration::from_secs(started.elapsed().as_secs());
    info!(
        "✅ Reproducción completada en {}: {} frames entregados",
        humantime::format_duration(elapsed),
        transport.frames_sent()
    );

    Ok(())
}
