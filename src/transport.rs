//! # Voice Transport
//!
//! Abstraction over the live voice channel that receives encoded frames.
//!
//! The streaming pipeline only ever talks to [`VoiceTransport`]: a readiness
//! flag, a speaking indicator, a bounded frame sink and a disconnect
//! operation. The Discord (or any other) client library sits behind this
//! trait; the crate itself never touches a gateway.
//!
//! [`ChannelTransport`] is the bundled implementation over a bounded frame
//! channel. It backs the demo binary and the test suite, and doubles as the
//! reference for writing a real client-backed transport.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::error::StreamError;
use crate::ids::GuildId;

/// Un frame Opus listo para entregar al transporte.
pub type OpusFrame = Bytes;

/// Fallos al entregar un frame al transporte.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameSendError {
    /// El transporte no aceptó el frame dentro de la espera acotada.
    #[error("el transporte no aceptó el frame a tiempo")]
    Busy,
    /// El extremo receptor del transporte ya no existe.
    #[error("el canal del transporte está cerrado")]
    Closed,
}

/// Canal de voz en vivo que consume frames Opus.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Snapshot de si el transporte puede aceptar frames ahora mismo.
    fn is_ready(&self) -> bool;

    /// Enciende o apaga el indicador de "hablando".
    async fn set_speaking(&self, speaking: bool);

    /// Entrega un frame con espera acotada.
    ///
    /// El que llama decide qué hacer con un [`FrameSendError::Busy`]; el
    /// pipeline lo registra y descarta el frame en lugar de bloquear.
    async fn send_frame(&self, frame: OpusFrame, wait: Duration) -> Result<(), FrameSendError>;

    /// Cierra la conexión de voz y libera sus recursos.
    async fn disconnect(&self);
}

/// Obtiene (o reutiliza) la conexión de voz de un guild.
///
/// Es la costura donde vive la librería cliente real; el orquestador solo
/// pide "una conexión para este guild" y trata el fallo como error de
/// adquisición, fatal para el stream.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn acquire(&self, guild_id: GuildId) -> Result<Arc<dyn VoiceTransport>, StreamError>;
}

/// Transporte respaldado por un canal acotado de frames.
///
/// El productor es el pipeline; el consumidor es quien posea el
/// [`flume::Receiver`] devuelto por [`ChannelTransport::new`] (en el binario
/// de demostración, una tarea que drena un frame cada 20ms).
pub struct ChannelTransport {
    frames: flume::Sender<OpusFrame>,
    ready: AtomicBool,
    speaking: AtomicBool,
    sent: AtomicU64,
}

impl ChannelTransport {
    /// Crea el transporte y devuelve el extremo consumidor del canal.
    pub fn new(capacity: usize) -> (Arc<Self>, flume::Receiver<OpusFrame>) {
        let (tx, rx) = flume::bounded(capacity);
        let transport = Arc::new(Self {
            frames: tx,
            ready: AtomicBool::new(true),
            speaking: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        });
        (transport, rx)
    }

    /// Cambia manualmente el estado de readiness (útil en tests).
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Snapshot del indicador de "hablando".
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Total de frames aceptados por el canal.
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceTransport for ChannelTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.frames.is_disconnected()
    }

    async fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::SeqCst);
        debug!("🎙️ Indicador de voz: {}", speaking);
    }

    async fn send_frame(&self, frame: OpusFrame, wait: Duration) -> Result<(), FrameSendError> {
        match tokio::time::timeout(wait, self.frames.send_async(frame)).await {
            Ok(Ok(())) => {
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(_)) => Err(FrameSendError::Closed),
            Err(_) => Err(FrameSendError::Busy),
        }
    }

    async fn disconnect(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.speaking.store(false, Ordering::SeqCst);
        debug!("👋 Transporte desconectado");
    }
}
