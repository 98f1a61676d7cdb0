use thiserror::Error;

/// Errores del pipeline de streaming.
///
/// El supervisor clasifica cada variante como recuperable o fatal con
/// [`StreamError::is_recoverable`]; la clasificación se hace por variante,
/// nunca comparando texto de mensajes.
#[derive(Debug, Error)]
pub enum StreamError {
    /// La fuente de audio no pudo iniciarse (proceso de decodificación o
    /// adquisición de transporte). Fatal, sin reintentos.
    #[error("no se pudo iniciar la fuente de audio: {0}")]
    Acquisition(String),

    /// La lectura de PCM excedió el tiempo máximo configurado.
    #[error("timeout leyendo PCM del decodificador")]
    ReadTimeout,

    /// El transporte de voz no llegó a estar listo, o dejó de estarlo.
    #[error("el transporte de voz no está listo")]
    TransportNotReady,

    /// No se observó ningún frame dentro de la ventana de salud.
    #[error("sin frames nuevos dentro de la ventana de salud")]
    HealthStaleness,

    /// Se agotaron los reinicios automáticos permitidos.
    #[error("presupuesto de reinicios agotado tras {0} intentos")]
    RestartBudgetExhausted(u32),

    /// Ya hay un stream activo en este supervisor.
    #[error("ya hay un stream activo en este supervisor")]
    AlreadyPlaying,

    /// Fallo del encoder Opus.
    #[error("error del encoder Opus: {0}")]
    Encode(String),

    /// Error de E/S leyendo del proceso de decodificación.
    #[error("error de E/S en el stream: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Indica si el supervisor puede reintentar tras este error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ReadTimeout | Self::TransportNotReady | Self::HealthStaleness
        )
    }
}

/// Errores de las operaciones de cola.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Índice fuera del rango `[0, size)`. La cola queda intacta.
    #[error("índice {index} fuera de rango (tamaño {size})")]
    IndexOutOfRange { index: usize, size: usize },
}
