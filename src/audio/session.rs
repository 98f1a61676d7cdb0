use parking_lot::Mutex;
use std::sync::Arc;

use crate::audio::pipeline::{Stage, StreamPipeline};
use crate::audio::queue::{PlayQueue, QueueItem, QueueSnapshot, TrackMetadata};
use crate::error::QueueError;
use crate::ids::{GuildId, UserId};
use crate::transport::VoiceTransport;

/// Fase conjunta de la sesión, derivada del flag de la cola y del estado del
/// pipeline.
///
/// El flag de la sesión manda sobre la intención ("debería sonar"); el
/// pipeline confirma lo que de verdad está pasando. Tras un fallo, la fase
/// resultante es `Stopped` aunque la cola aún tenga intención de sonar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    /// Nada pedido, nada sonando.
    Idle,
    /// La sesión quiere sonar pero todavía no hay pipeline montado.
    Queued,
    /// Hay pipeline montado que aún no confirma streaming.
    Starting,
    /// El pipeline confirma que está emitiendo frames.
    Active,
    /// El último pipeline terminó (fin natural, stop o fallo).
    Stopped,
}

struct SessionState {
    queue: PlayQueue,
    playing: bool,
    skip_requested: bool,
    transport: Option<Arc<dyn VoiceTransport>>,
    pipeline: Option<Arc<StreamPipeline>>,
}

/// Estado de reproducción de un guild.
///
/// Todas las operaciones son seguras bajo concurrencia: cada una toma el
/// único lock de la sesión. Se crea de forma perezosa en el registro y vive
/// lo que viva el proceso; solo se resetea lógicamente con `clear` o el
/// barrido de inactividad.
pub struct GuildSession {
    guild_id: GuildId,
    state: Mutex<SessionState>,
}

impl GuildSession {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            state: Mutex::new(SessionState {
                queue: PlayQueue::new(),
                playing: false,
                skip_requested: false,
                transport: None,
                pipeline: None,
            }),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    // Operaciones de cola

    /// Agrega un item al final de la cola.
    pub fn add(&self, item: QueueItem) {
        self.state.lock().queue.add(item);
    }

    /// Construye el item con sus metadatos y lo agrega al final.
    pub fn add_with_metadata(
        &self,
        locator: impl Into<String>,
        title: impl Into<String>,
        requested_by: UserId,
        meta: TrackMetadata,
    ) {
        let item = QueueItem::new(locator, title, requested_by).with_metadata(meta);
        self.add(item);
    }

    /// Saca el primer item de la cola y lo marca como actual.
    pub fn next(&self) -> Option<QueueItem> {
        self.state.lock().queue.next()
    }

    /// Elimina el item en `index`; la cola queda intacta si está fuera de
    /// rango.
    pub fn remove(&self, index: usize) -> Result<QueueItem, QueueError> {
        self.state.lock().queue.remove(index)
    }

    /// Vacía la cola y olvida el item actual.
    pub fn clear(&self) {
        self.state.lock().queue.clear();
    }

    pub fn list(&self) -> Vec<QueueItem> {
        self.state.lock().queue.list()
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        let st = self.state.lock();
        st.queue.len() == 0 && st.queue.current().is_none()
    }

    pub fn current(&self) -> Option<QueueItem> {
        self.state.lock().queue.current().cloned()
    }

    /// Olvida el item actual sin tocar la cola pendiente.
    pub fn clear_current(&self) {
        self.state.lock().queue.clear_current();
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.state.lock().queue.snapshot()
    }

    // Flags de reproducción

    /// Intención de reproducción de la cola, independiente de que exista un
    /// pipeline confirmando streaming.
    pub fn set_playing(&self, playing: bool) {
        self.state.lock().playing = playing;
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Marca la intención de sonar solo si nadie la tenía ya. Devuelve
    /// `false` si la sesión ya estaba reproduciendo.
    pub fn try_begin_playback(&self) -> bool {
        let mut st = self.state.lock();
        if st.playing {
            false
        } else {
            st.playing = true;
            true
        }
    }

    pub fn request_skip(&self) {
        self.state.lock().skip_requested = true;
    }

    /// Consume el flag de salto, dejándolo apagado.
    pub fn take_skip(&self) -> bool {
        let mut st = self.state.lock();
        std::mem::take(&mut st.skip_requested)
    }

    // Enlaces con transporte y pipeline

    pub fn set_transport(&self, transport: Option<Arc<dyn VoiceTransport>>) {
        self.state.lock().transport = transport;
    }

    pub fn transport(&self) -> Option<Arc<dyn VoiceTransport>> {
        self.state.lock().transport.clone()
    }

    pub fn set_pipeline(&self, pipeline: Option<Arc<StreamPipeline>>) {
        self.state.lock().pipeline = pipeline;
    }

    pub fn pipeline(&self) -> Option<Arc<StreamPipeline>> {
        self.state.lock().pipeline.clone()
    }

    /// Enlaza transporte y pipeline de una vez, reemplazando los anteriores.
    pub fn bind(&self, transport: Arc<dyn VoiceTransport>, pipeline: Arc<StreamPipeline>) {
        let mut st = self.state.lock();
        st.transport = Some(transport);
        st.pipeline = Some(pipeline);
    }

    /// Si la sesión estaba sonando, apaga la intención, olvida el item
    /// actual y desengancha pipeline y transporte en una sola operación
    /// atómica, devolviéndolos para que el barrido los cierre fuera del lock.
    #[allow(clippy::type_complexity)]
    pub fn begin_idle_stop(
        &self,
    ) -> Option<(Option<Arc<StreamPipeline>>, Option<Arc<dyn VoiceTransport>>)> {
        let mut st = self.state.lock();
        if !st.playing {
            return None;
        }

        st.playing = false;
        st.skip_requested = false;
        st.queue.clear_current();
        Some((st.pipeline.take(), st.transport.take()))
    }

    /// Fase conjunta de cola y pipeline.
    pub fn phase(&self) -> PlaybackPhase {
        let st = self.state.lock();
        match (&st.pipeline, st.playing) {
            (None, false) => PlaybackPhase::Idle,
            (None, true) => PlaybackPhase::Queued,
            (Some(pipeline), _) => match pipeline.stage() {
                Stage::Idle | Stage::Starting | Stage::Restarting => PlaybackPhase::Starting,
                Stage::Streaming => PlaybackPhase::Active,
                Stage::Completed | Stage::Stopped => PlaybackPhase::Stopped,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::ChannelTransport;

    fn item(title: &str) -> QueueItem {
        QueueItem::new(format!("https://cdn.example/{title}"), title, UserId(1))
    }

    #[test]
    fn test_session_queue_roundtrip() {
        let session = GuildSession::new(GuildId(42));
        session.add(item("a"));
        session.add_with_metadata(
            "https://cdn.example/b",
            "b",
            UserId(2),
            TrackMetadata::default(),
        );

        assert_eq!(session.len(), 2);
        assert_eq!(session.next().unwrap().title, "a");
        assert_eq!(session.current().unwrap().title, "a");
        assert_eq!(session.list().len(), 1);

        session.clear();
        assert!(session.is_empty());
    }

    #[test]
    fn test_try_begin_playback_is_exclusive() {
        let session = GuildSession::new(GuildId(1));

        assert!(session.try_begin_playback());
        assert!(!session.try_begin_playback());
        assert!(session.is_playing());

        session.set_playing(false);
        assert!(session.try_begin_playback());
    }

    #[test]
    fn test_take_skip_consumes_flag() {
        let session = GuildSession::new(GuildId(1));

        assert!(!session.take_skip());
        session.request_skip();
        assert!(session.take_skip());
        assert!(!session.take_skip());
    }

    #[test]
    fn test_phase_table_without_pipeline() {
        let session = GuildSession::new(GuildId(1));
        assert_eq!(session.phase(), PlaybackPhase::Idle);

        session.set_playing(true);
        assert_eq!(session.phase(), PlaybackPhase::Queued);
    }

    #[test]
    fn test_phase_follows_bound_pipeline() {
        let session = GuildSession::new(GuildId(1));
        let (transport, _rx) = ChannelTransport::new(4);
        let pipeline = Arc::new(StreamPipeline::new(
            Arc::new(Config::default()),
            transport.clone(),
        ));

        session.set_playing(true);
        session.bind(transport, pipeline);

        // Pipeline recién montado, sin confirmar streaming todavía
        assert_eq!(session.phase(), PlaybackPhase::Starting);
    }

    #[test]
    fn test_begin_idle_stop_only_when_playing() {
        let session = GuildSession::new(GuildId(1));
        assert!(session.begin_idle_stop().is_none());

        session.add(item("a"));
        session.next();
        session.set_playing(true);

        let (pipeline, transport) = session.begin_idle_stop().unwrap();
        assert!(pipeline.is_none());
        assert!(transport.is_none());
        assert!(!session.is_playing());
        assert!(session.current().is_none());
        // La cola pendiente no se toca
        assert_eq!(session.phase(), PlaybackPhase::Idle);
    }

    #[test]
    fn test_bind_replaces_previous_bindings() {
        let session = GuildSession::new(GuildId(1));
        let config = Arc::new(Config::default());
        let (t1, _rx1) = ChannelTransport::new(4);
        let (t2, _rx2) = ChannelTransport::new(4);
        let p1 = Arc::new(StreamPipeline::new(config.clone(), t1.clone()));
        let p2 = Arc::new(StreamPipeline::new(config, t2.clone()));

        session.bind(t1, p1.clone());
        session.bind(t2, p2.clone());

        assert!(Arc::ptr_eq(&session.pipeline().unwrap(), &p2));
    }
}
