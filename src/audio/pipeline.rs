use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

use crate::audio::decoder::{pcm_to_samples, DecodeProcess, PcmBlock};
use crate::audio::encoder::FrameEncoder;
use crate::config::Config;
use crate::error::StreamError;
use crate::transport::{FrameSendError, VoiceTransport};

/// Etapa observable del supervisor de stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Starting,
    Streaming,
    Restarting,
    Completed,
    Stopped,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Stopped)
    }
}

/// Desenlace de una supervisión.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Stopped,
    Failed,
}

/// Eventos que las tareas del ciclo mandan al supervisor.
enum CycleEvent {
    Finished,
    Failed(StreamError),
}

struct PipelineState {
    stage: Stage,
    playing: bool,
    restarts: u32,
    last_frame_at: Option<Instant>,
    task_running: bool,
}

struct PipelineShared {
    config: Arc<Config>,
    transport: Arc<dyn VoiceTransport>,
    cancel: CancellationToken,
    finished: CancellationToken,
    state: Mutex<PipelineState>,
}

/// Supervisor de un ciclo decodificar→codificar→enviar.
///
/// Cada instancia sirve exactamente un stream: [`StreamPipeline::play_stream`]
/// lo arranca en una tarea cancelable y lo reinicia ante errores recuperables
/// hasta agotar el presupuesto configurado. El estado interno vive bajo su
/// propio lock, separado del lock de sesión, para que una operación lenta del
/// pipeline nunca bloquee las lecturas de la cola.
pub struct StreamPipeline {
    shared: Arc<PipelineShared>,
}

impl StreamPipeline {
    pub fn new(config: Arc<Config>, transport: Arc<dyn VoiceTransport>) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                config,
                transport,
                cancel: CancellationToken::new(),
                finished: CancellationToken::new(),
                state: Mutex::new(PipelineState {
                    stage: Stage::Idle,
                    playing: false,
                    restarts: 0,
                    last_frame_at: None,
                    task_running: false,
                }),
            }),
        }
    }

    /// Arranca el stream del locator dado y devuelve de inmediato.
    ///
    /// Falla con [`StreamError::AlreadyPlaying`] si este supervisor ya tiene
    /// un stream activo. El contador de reinicios se resetea aquí y nunca a
    /// mitad de stream.
    pub fn play_stream(&self, locator: &str) -> Result<(), StreamError> {
        {
            let mut st = self.shared.state.lock();
            if st.playing {
                return Err(StreamError::AlreadyPlaying);
            }
            if st.stage.is_terminal() || self.shared.cancel.is_cancelled() {
                // Instancia de un solo uso: un supervisor terminado no se rearma.
                return Err(StreamError::Acquisition(
                    "el supervisor ya terminó".to_string(),
                ));
            }
            st.playing = true;
            st.task_running = true;
            st.restarts = 0;
            st.last_frame_at = None;
            st.stage = Stage::Starting;
        }

        info!("▶️ Iniciando stream: {}", locator);

        let shared = self.shared.clone();
        let locator = locator.to_owned();
        tokio::spawn(async move {
            PipelineShared::supervise(shared, locator).await;
        });

        Ok(())
    }

    /// Detiene el stream: cancela todo el trabajo en vuelo, termina el
    /// proceso de decodificación y apaga el indicador de voz.
    ///
    /// Idempotente y seguro de llamar concurrentemente, incluso después de
    /// que el stream ya haya terminado por su cuenta.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();

        let task_running = {
            let mut st = self.shared.state.lock();
            st.playing = false;
            if !st.task_running && !st.stage.is_terminal() {
                st.stage = Stage::Stopped;
            }
            st.task_running
        };

        self.shared.transport.set_speaking(false).await;

        if !task_running {
            // Sin tarea supervisora viva, el evento terminal se emite aquí.
            self.shared.finished.cancel();
        }

        debug!("⏹️ Stop solicitado");
    }

    /// Snapshot del flag de reproducción.
    pub fn is_playing(&self) -> bool {
        self.shared.state.lock().playing
    }

    /// Reinicios consumidos por el stream actual.
    pub fn restarts(&self) -> u32 {
        self.shared.state.lock().restarts
    }

    /// Etapa actual del supervisor.
    pub fn stage(&self) -> Stage {
        self.shared.state.lock().stage
    }

    /// Evento terminal del supervisor.
    ///
    /// Se resuelve cuando el stream llegó a `Completed` o `Stopped`; el
    /// orquestador lo espera en lugar de sondear [`Self::is_playing`].
    pub fn finished(&self) -> WaitForCancellationFuture<'_> {
        self.shared.finished.cancelled()
    }
}

impl PipelineShared {
    /// Bucle supervisor: corre ciclos de streaming y decide reinicio o fin.
    ///
    /// Todos los fallos del ciclo llegan por el mismo canal de eventos y se
    /// clasifican por variante en un único punto.
    async fn supervise(shared: Arc<Self>, locator: String) {
        let max_restarts = shared.config.max_restarts;

        let outcome = loop {
            let attempt = Self::run_cycle(&shared, &locator).await;

            if shared.cancel.is_cancelled() {
                break Outcome::Stopped;
            }

            match attempt {
                Ok(()) => break Outcome::Completed,
                Err(err) if err.is_recoverable() => {
                    let restarts = {
                        let mut st = shared.state.lock();
                        if st.restarts >= max_restarts {
                            None
                        } else {
                            st.restarts += 1;
                            st.stage = Stage::Restarting;
                            Some(st.restarts)
                        }
                    };

                    let Some(restarts) = restarts else {
                        error!(
                            "💥 Stream abandonado: {}",
                            StreamError::RestartBudgetExhausted(max_restarts)
                        );
                        break Outcome::Failed;
                    };

                    warn!(
                        "🔁 Error recuperable en el stream ({}), reinicio {}/{}",
                        err, restarts, max_restarts
                    );

                    tokio::select! {
                        _ = shared.cancel.cancelled() => break Outcome::Stopped,
                        _ = tokio::time::sleep(shared.config.restart_backoff()) => {}
                    }
                }
                Err(err) => {
                    error!("❌ Error fatal en el stream: {}", err);
                    break Outcome::Failed;
                }
            }
        };

        shared.finish(outcome).await;
    }

    /// Un ciclo completo: decodificador, espera de transporte, streaming y
    /// ticker de salud, hasta el primer evento o la cancelación.
    async fn run_cycle(shared: &Arc<Self>, locator: &str) -> Result<(), StreamError> {
        if shared.cancel.is_cancelled() {
            return Ok(());
        }

        {
            shared.state.lock().stage = Stage::Starting;
        }

        let decoder = DecodeProcess::spawn(&shared.config, locator)?;

        tokio::select! {
            _ = shared.cancel.cancelled() => return Ok(()),
            ready = Self::wait_transport_ready(shared) => ready?,
        }

        shared.transport.set_speaking(true).await;
        {
            let mut st = shared.state.lock();
            st.stage = Stage::Streaming;
            st.last_frame_at = Some(Instant::now());
        }

        let (events_tx, mut events_rx) = mpsc::channel(8);
        let streamer = tokio::spawn(Self::stream_frames(
            shared.clone(),
            decoder,
            events_tx.clone(),
        ));
        let health = tokio::spawn(Self::health_ticker(shared.clone(), events_tx));

        let result = tokio::select! {
            _ = shared.cancel.cancelled() => Ok(()),
            event = events_rx.recv() => match event {
                Some(CycleEvent::Finished) | None => Ok(()),
                Some(CycleEvent::Failed(err)) => Err(err),
            },
        };

        // Al abortar el streamer cae el proceso de decodificación con él.
        streamer.abort();
        health.abort();
        shared.transport.set_speaking(false).await;

        result
    }

    /// Espera a que el transporte esté listo, con límite superior.
    async fn wait_transport_ready(shared: &Arc<Self>) -> Result<(), StreamError> {
        let deadline = Instant::now() + shared.config.ready_timeout();

        while !shared.transport.is_ready() {
            if Instant::now() >= deadline {
                return Err(StreamError::TransportNotReady);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(())
    }

    /// Bucle de streaming: lee bloques de PCM, codifica y entrega frames en
    /// estricto orden de lectura.
    async fn stream_frames(
        shared: Arc<Self>,
        mut decoder: DecodeProcess,
        events: mpsc::Sender<CycleEvent>,
    ) {
        let mut encoder = match FrameEncoder::new(&shared.config) {
            Ok(encoder) => encoder,
            Err(err) => {
                let _ = events.send(CycleEvent::Failed(err)).await;
                return;
            }
        };

        let mut block = vec![0u8; shared.config.block_bytes()];
        let mut frames: u64 = 0;

        loop {
            match decoder.read_block(&mut block).await {
                Ok(PcmBlock::Eof) => {
                    debug!("🏁 Fin de stream tras {} frames", frames);
                    decoder.shutdown().await;
                    let _ = events.send(CycleEvent::Finished).await;
                    return;
                }
                Ok(kind) => {
                    if let PcmBlock::Short(bytes) = kind {
                        debug!("🔇 Bloque corto de {} bytes rellenado con silencio", bytes);
                    }

                    let samples = pcm_to_samples(&block);
                    let frame = match encoder.encode(&samples) {
                        Ok(frame) => frame,
                        Err(err) => {
                            let _ = events.send(CycleEvent::Failed(err)).await;
                            return;
                        }
                    };

                    {
                        shared.state.lock().last_frame_at = Some(Instant::now());
                    }

                    match shared
                        .transport
                        .send_frame(frame, shared.config.send_timeout())
                        .await
                    {
                        Ok(()) => frames += 1,
                        Err(FrameSendError::Busy) => {
                            // Continuidad antes que completitud: se pierde el frame.
                            warn!("📦 Transporte saturado, frame descartado");
                        }
                        Err(FrameSendError::Closed) => {
                            let _ = events
                                .send(CycleEvent::Failed(StreamError::TransportNotReady))
                                .await;
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = events.send(CycleEvent::Failed(err)).await;
                    return;
                }
            }
        }
    }

    /// Chequeo periódico de salud: frescura de frames y readiness del
    /// transporte. Solo se evalúa mientras el stream está reproduciendo.
    async fn health_ticker(shared: Arc<Self>, events: mpsc::Sender<CycleEvent>) {
        let mut ticker = tokio::time::interval(shared.config.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // El primer tick de un interval resuelve al instante.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let stale = {
                let st = shared.state.lock();
                if !st.playing {
                    continue;
                }
                st.last_frame_at
                    .map(|at| at.elapsed() > shared.config.stale_threshold())
                    .unwrap_or(false)
            };

            if stale {
                warn!("🩺 Sin frames nuevos dentro de la ventana de salud");
                let _ = events
                    .send(CycleEvent::Failed(StreamError::HealthStaleness))
                    .await;
                return;
            }

            if !shared.transport.is_ready() {
                warn!("🩺 El transporte dejó de estar listo");
                let _ = events
                    .send(CycleEvent::Failed(StreamError::TransportNotReady))
                    .await;
                return;
            }
        }
    }

    /// Cierre terminal: apaga flags, limpia el indicador de voz y emite el
    /// evento de terminación. Se llama exactamente una vez por supervisión.
    async fn finish(&self, outcome: Outcome) {
        {
            let mut st = self.state.lock();
            st.playing = false;
            st.task_running = false;
            if !st.stage.is_terminal() {
                st.stage = match outcome {
                    Outcome::Completed => Stage::Completed,
                    Outcome::Stopped | Outcome::Failed => Stage::Stopped,
                };
            }
        }

        self.transport.set_speaking(false).await;
        self.finished.cancel();

        match outcome {
            Outcome::Completed => info!("✅ Stream completado"),
            Outcome::Stopped => debug!("⏹️ Stream detenido"),
            Outcome::Failed => debug!("🪦 Stream terminado por error"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use std::os::unix::fs::PermissionsExt;
    use tokio::time::timeout;

    /// Escribe un script que suplanta a ffmpeg ignorando sus argumentos.
    fn script_config(
        body: &str,
        tweak: impl FnOnce(&mut Config),
    ) -> (tempfile::TempDir, Arc<Config>) {
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

    #[tokio::test]
    async fn test_clean_completion_keeps_restart_counter_at_zero() {
        let (_dir, config) = script_config("head -c 15360 /dev/zero", |_| {});
        let (transport, _rx) = ChannelTransport::new(64);
        let pipeline = StreamPipeline::new(config, transport.clone());

        pipeline.play_stream("https://radio.example/stream").unwrap();
        timeout(Duration::from_secs(10), pipeline.finished())
            .await
            .unwrap();

        assert!(!pipeline.is_playing());
        assert_eq!(pipeline.restarts(), 0);
        assert_eq!(pipeline.stage(), Stage::Completed);
        assert!(!transport.is_speaking());
        assert_eq!(transport.frames_sent(), 4);
    }

    #[tokio::test]
    async fn test_play_stream_twice_is_already_playing() {
        let (_dir, config) = script_config("head -c 3840 /dev/zero\nsleep 30", |c| {
            c.read_timeout_ms = 30_000;
        });
        let (transport, _rx) = ChannelTransport::new(64);
        let pipeline = StreamPipeline::new(config, transport.clone());

        pipeline.play_stream("https://radio.example/a").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(pipeline.is_playing());
        assert!(matches!(
            pipeline.play_stream("https://radio.example/b"),
            Err(StreamError::AlreadyPlaying)
        ));

        pipeline.stop().await;
        timeout(Duration::from_secs(5), pipeline.finished())
            .await
            .unwrap();

        assert!(!pipeline.is_playing());
        assert_eq!(pipeline.stage(), Stage::Stopped);
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_concurrent_safe() {
        let (_dir, config) = script_config("sleep 30", |c| {
            c.read_timeout_ms = 30_000;
        });
        let (transport, _rx) = ChannelTransport::new(4);
        let pipeline = Arc::new(StreamPipeline::new(config, transport.clone()));

        pipeline.play_stream("https://radio.example/a").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let a = pipeline.clone();
        let b = pipeline.clone();
        tokio::join!(a.stop(), b.stop());
        timeout(Duration::from_secs(5), pipeline.finished())
            .await
            .unwrap();

        // Repetir stop tras la terminación natural sigue siendo seguro
        pipeline.stop().await;

        assert!(!pipeline.is_playing());
        assert_eq!(pipeline.stage(), Stage::Stopped);
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_stop_without_play_emits_terminal_event() {
        let (_dir, config) = script_config("true", |_| {});
        let (transport, _rx) = ChannelTransport::new(4);
        let pipeline = StreamPipeline::new(config, transport);

        pipeline.stop().await;
        timeout(Duration::from_secs(1), pipeline.finished())
            .await
            .unwrap();

        assert_eq!(pipeline.stage(), Stage::Stopped);
        assert!(pipeline.play_stream("https://radio.example/a").is_err());
    }

    #[tokio::test]
    async fn test_two_read_timeouts_then_completion() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("attempts");
        let body = format!(
            "n=$(cat {state} 2>/dev/null || echo 0)\n\
             echo $((n+1)) > {state}\n\
             if [ \"$n\" -lt 2 ]; then\n  sleep 2\nelse\n  head -c 7680 /dev/zero\nfi",
            state = state.display()
        );
        let (_dir2, config) = script_config(&body, |c| {
            c.read_timeout_ms = 200;
            c.restart_backoff_ms = 50;
            c.max_restarts = 3;
        });
        let (transport, _rx) = ChannelTransport::new(64);
        let pipeline = StreamPipeline::new(config, transport.clone());

        pipeline.play_stream("https://radio.example/flaky").unwrap();
        timeout(Duration::from_secs(10), pipeline.finished())
            .await
            .unwrap();

        assert_eq!(pipeline.restarts(), 2);
        assert_eq!(pipeline.stage(), Stage::Completed);
        assert_eq!(transport.frames_sent(), 2);
        drop(dir);
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion_is_terminal() {
        let (_dir, config) = script_config("sleep 2", |c| {
            c.read_timeout_ms = 100;
            c.restart_backoff_ms = 10;
            c.max_restarts = 2;
        });
        let (transport, _rx) = ChannelTransport::new(4);
        let pipeline = StreamPipeline::new(config, transport.clone());

        pipeline.play_stream("https://radio.example/dead").unwrap();
        timeout(Duration::from_secs(10), pipeline.finished())
            .await
            .unwrap();

        // El contador nunca supera el máximo configurado
        assert_eq!(pipeline.restarts(), 2);
        assert_eq!(pipeline.stage(), Stage::Stopped);
        assert!(!pipeline.is_playing());
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_acquisition_failure_is_fatal_without_restart() {
        let mut config = Config::default();
        config.ffmpeg_path = "/definitivamente/no/existe".to_string();
        let (transport, _rx) = ChannelTransport::new(4);
        let pipeline = StreamPipeline::new(Arc::new(config), transport);

        pipeline.play_stream("https://radio.example/a").unwrap();
        timeout(Duration::from_secs(5), pipeline.finished())
            .await
            .unwrap();

        assert_eq!(pipeline.restarts(), 0);
        assert_eq!(pipeline.stage(), Stage::Stopped);
    }

    #[tokio::test]
    async fn test_transport_never_ready_exhausts_budget() {
        let (_dir, config) = script_config("head -c 3840 /dev/zero", |c| {
            c.ready_timeout_ms = 100;
            c.restart_backoff_ms = 10;
            c.max_restarts = 1;
        });
        let (transport, _rx) = ChannelTransport::new(4);
        transport.set_ready(false);
        let pipeline = StreamPipeline::new(config, transport.clone());

        pipeline.play_stream("https://radio.example/a").unwrap();
        timeout(Duration::from_secs(10), pipeline.finished())
            .await
            .unwrap();

        assert_eq!(pipeline.restarts(), 1);
        assert_eq!(pipeline.stage(), Stage::Stopped);
        assert_eq!(transport.frames_sent(), 0);
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_health_staleness_triggers_restart() {
        let (_dir, config) = script_config("head -c 3840 /dev/zero\nsleep 30", |c| {
            c.read_timeout_ms = 60_000;
            c.health_interval_ms = 100;
            c.stale_threshold_ms = 300;
            c.restart_backoff_ms = 10;
            c.max_restarts = 1;
        });
        let (transport, _rx) = ChannelTransport::new(64);
        let pipeline = StreamPipeline::new(config, transport.clone());

        pipeline.play_stream("https://radio.example/stalled").unwrap();
        timeout(Duration::from_secs(10), pipeline.finished())
            .await
            .unwrap();

        assert_eq!(pipeline.restarts(), 1);
        assert_eq!(pipeline.stage(), Stage::Stopped);
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_stop_during_stall_does_not_count_as_restart() {
        let (_dir, config) = script_config("sleep 30", |c| {
            c.read_timeout_ms = 30_000;
        });
        let (transport, _rx) = ChannelTransport::new(4);
        let pipeline = StreamPipeline::new(config, transport);

        pipeline.play_stream("https://radio.example/a").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.stop().await;
        timeout(Duration::from_secs(5), pipeline.finished())
            .await
            .unwrap();

        assert_eq!(pipeline.restarts(), 0);
        assert_eq!(pipeline.stage(), Stage::Stopped);
    }
}
