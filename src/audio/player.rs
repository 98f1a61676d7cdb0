use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::audio::pipeline::StreamPipeline;
use crate::audio::queue::QueueItem;
use crate::audio::session::GuildSession;
use crate::config::Config;
use crate::error::StreamError;
use crate::ids::GuildId;
use crate::registry::SessionRegistry;
use crate::transport::{TransportProvider, VoiceTransport};

/// Orquestador de reproducción por guild.
///
/// Hace avanzar la cola con un bucle explícito: saca el siguiente item,
/// monta un supervisor nuevo sobre la conexión de voz y espera su evento
/// terminal antes de tocar el siguiente. Garantiza un único supervisor
/// activo por sesión.
pub struct PlaybackDriver {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
}

impl PlaybackDriver {
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Encola un item y, si la sesión estaba en silencio, adquiere la
    /// conexión de voz y arranca el bucle de avance.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        item: QueueItem,
        provider: &dyn TransportProvider,
    ) -> Result<(), StreamError> {
        let session = self.registry.get_or_create(guild_id);
        session.add(item);
        self.registry.touch(guild_id);

        if session.try_begin_playback() {
            let transport = match provider.acquire(guild_id).await {
                Ok(transport) => transport,
                Err(err) => {
                    session.set_playing(false);
                    return Err(err);
                }
            };
            self.spawn_advance_loop(session, transport);
        }

        Ok(())
    }

    /// Arranca el bucle de avance sobre una conexión ya adquirida.
    ///
    /// La sesión debe tener la intención de reproducción ya tomada (ver
    /// [`GuildSession::try_begin_playback`]).
    pub fn spawn_advance_loop(
        &self,
        session: Arc<GuildSession>,
        transport: Arc<dyn VoiceTransport>,
    ) -> JoinHandle<()> {
        let config = self.config.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            Self::advance_loop(config, registry, session, transport).await;
        })
    }

    /// Bucle de avance: un item por vuelta, un supervisor por item.
    async fn advance_loop(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        session: Arc<GuildSession>,
        transport: Arc<dyn VoiceTransport>,
    ) {
        loop {
            let Some(item) = session.next() else {
                session.set_playing(false);
                session.clear_current();
                session.set_pipeline(None);
                info!("📭 Cola terminada en guild {}", session.guild_id());
                break;
            };

            registry.touch(session.guild_id());

            let pipeline = Arc::new(StreamPipeline::new(config.clone(), transport.clone()));
            session.bind(transport.clone(), pipeline.clone());

            info!("🎵 Reproduciendo: {}", item.title);
            if let Err(err) = pipeline.play_stream(&item.locator) {
                error!("❌ No se pudo arrancar {}: {}", item.title, err);
                continue;
            }

            // El siguiente item solo arranca cuando este supervisor terminó.
            pipeline.finished().await;

            if session.take_skip() {
                debug!("⏭️ Item saltado: {}", item.title);
            }

            if !session.is_playing() {
                debug!("⏹️ Reproducción detenida externamente en guild {}", session.guild_id());
                break;
            }
        }
    }

    /// Salta el item actual; el bucle de avance pasa al siguiente.
    pub async fn skip(&self, guild_id: GuildId) -> bool {
        let Some(session) = self.registry.get(guild_id) else {
            return false;
        };

        self.registry.touch(guild_id);

        let Some(pipeline) = session.pipeline() else {
            return false;
        };

        session.request_skip();
        pipeline.stop().await;
        true
    }

    /// Detiene la reproducción y limpia la cola del guild.
    pub async fn stop(&self, guild_id: GuildId) -> bool {
        let Some(session) = self.registry.get(guild_id) else {
            return false;
        };

        self.registry.touch(guild_id);
        session.clear();
        session.set_playing(false);

        if let Some(pipeline) = session.pipeline() {
            pipeline.stop().await;
        }

        info!("⏹️ Reproducción detenida en guild {}", guild_id);
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audio::session::PlaybackPhase;
    use crate::ids::UserId;
    use crate::transport::ChannelTransport;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::time::timeout;

    struct FixedProvider {
        transport: Arc<ChannelTransport>,
    }

    #[async_trait]
    impl TransportProvider for FixedProvider {
        async fn acquire(&self, _guild_id: GuildId) -> Result<Arc<dyn VoiceTransport>, StreamError> {
            Ok(self.transport.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl TransportProvider for FailingProvider {
        async fn acquire(&self, _guild_id: GuildId) -> Result<Arc<dyn VoiceTransport>, StreamError> {
            Err(StreamError::Acquisition("sin canal de voz".to_string()))
        }
    }

    fn script_config(body: &str, tweak: impl FnOnce(&mut Config)) -> (tempfile::TempDir, Arc<Config>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-decoder.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();

        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let mut config = Config::default();
        config.ffmpeg_path = path.to_string_lossy().into_owned();
        config.reconnect = false;
        tweak(&mut config);

        (dir, Arc::new(config))
    }

    fn item(title: &str) -> QueueItem {
        QueueItem::new(format!("https://cdn.example/{title}"), title, UserId(5))
    }

    async fn wait_until_silent(session: &Arc<GuildSession>) {
        timeout(Duration::from_secs(15), async {
            while session.is_playing() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("la sesión nunca terminó de reproducir");
    }

    #[tokio::test]
    async fn test_queue_advances_through_all_items() {
        // Cada item emite exactamente dos frames
        let (_dir, config) = script_config("head -c 7680 /dev/zero", |_| {});
        let registry = Arc::new(SessionRegistry::new());
        let driver = PlaybackDriver::new(config, registry.clone());
        let (transport, _rx) = ChannelTransport::new(64);
        let provider = FixedProvider {
            transport: transport.clone(),
        };
        let guild = GuildId(10);

        driver.enqueue(guild, item("a"), &provider).await.unwrap();
        driver.enqueue(guild, item("b"), &provider).await.unwrap();
        driver.enqueue(guild, item("c"), &provider).await.unwrap();

        let session = registry.get(guild).unwrap();
        wait_until_silent(&session).await;

        assert_eq!(transport.frames_sent(), 6);
        assert_eq!(session.len(), 0);
        assert!(session.current().is_none());
        assert_eq!(session.phase(), PlaybackPhase::Idle);
    }

    #[tokio::test]
    async fn test_enqueue_while_playing_does_not_spawn_second_loop() {
        let (_dir, config) = script_config("head -c 3840 /dev/zero\nsleep 30", |c| {
            c.read_timeout_ms = 30_000;
        });
        let registry = Arc::new(SessionRegistry::new());
        let driver = PlaybackDriver::new(config, registry.clone());
        let (transport, _rx) = ChannelTransport::new(64);
        let provider = FixedProvider {
            transport: transport.clone(),
        };
        let guild = GuildId(11);

        driver.enqueue(guild, item("a"), &provider).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        driver.enqueue(guild, item("b"), &provider).await.unwrap();

        let session = registry.get(guild).unwrap();
        // El item b sigue encolado mientras a está activo
        assert_eq!(session.len(), 1);
        assert_eq!(session.current().unwrap().title, "a");

        driver.stop(guild).await;
        wait_until_silent(&session).await;
    }

    #[tokio::test]
    async fn test_skip_advances_to_next_item() {
        let (_dir, config) = script_config("head -c 3840 /dev/zero\nsleep 30", |c| {
            c.read_timeout_ms = 30_000;
        });
        let registry = Arc::new(SessionRegistry::new());
        let driver = PlaybackDriver::new(config, registry.clone());
        let (transport, _rx) = ChannelTransport::new(64);
        let provider = FixedProvider {
            transport: transport.clone(),
        };
        let guild = GuildId(12);

        driver.enqueue(guild, item("a"), &provider).await.unwrap();
        driver.enqueue(guild, item("b"), &provider).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(driver.skip(guild).await);

        let session = registry.get(guild).unwrap();
        timeout(Duration::from_secs(10), async {
            while session.current().map(|c| c.title) != Some("b".to_string()) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("nunca avanzó al siguiente item");

        driver.stop(guild).await;
        wait_until_silent(&session).await;
    }

    #[tokio::test]
    async fn test_stop_clears_queue_and_halts_loop() {
        let (_dir, config) = script_config("head -c 3840 /dev/zero\nsleep 30", |c| {
            c.read_timeout_ms = 30_000;
        });
        let registry = Arc::new(SessionRegistry::new());
        let driver = PlaybackDriver::new(config, registry.clone());
        let (transport, _rx) = ChannelTransport::new(64);
        let provider = FixedProvider {
            transport: transport.clone(),
        };
        let guild = GuildId(13);

        driver.enqueue(guild, item("a"), &provider).await.unwrap();
        driver.enqueue(guild, item("b"), &provider).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(driver.stop(guild).await);

        let session = registry.get(guild).unwrap();
        wait_until_silent(&session).await;

        assert_eq!(session.len(), 0);
        assert!(!session.is_playing());
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_failed_acquisition_reverts_playing_intent() {
        let (_dir, config) = script_config("true", |_| {});
        let registry = Arc::new(SessionRegistry::new());
        let driver = PlaybackDriver::new(config, registry.clone());
        let guild = GuildId(14);

        let err = driver
            .enqueue(guild, item("a"), &FailingProvider)
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Acquisition(_)));
        let session = registry.get(guild).unwrap();
        assert!(!session.is_playing());
        // El item queda encolado para el próximo intento
        assert_eq!(session.len(), 1);
    }

    #[tokio::test]
    async fn test_skip_without_session_or_pipeline() {
        let (_dir, config) = script_config("true", |_| {});
        let registry = Arc::new(SessionRegistry::new());
        let driver = PlaybackDriver::new(config, registry.clone());

        assert!(!driver.skip(GuildId(99)).await);

        registry.get_or_create(GuildId(99));
        assert!(!driver.skip(GuildId(99)).await);
    }
}
