use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Decodificador externo
    pub ffmpeg_path: String,
    pub reconnect: bool,

    // Audio
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_size: usize, // Muestras por canal por frame (960 = 20ms @ 48kHz)
    pub opus_bitrate: u32,

    // Límites del pipeline (en milisegundos)
    pub read_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub send_timeout_ms: u64,

    // Supervisión de salud
    pub health_interval_ms: u64,
    pub stale_threshold_ms: u64,

    // Política de reinicios
    pub max_restarts: u32,
    pub restart_backoff_ms: u64,

    // Barrido de sesiones inactivas
    pub idle_sweep_interval_ms: u64,
    pub idle_threshold_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Decodificador externo
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            reconnect: std::env::var("STREAM_RECONNECT")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,

            // Audio (valores estándar de Discord)
            sample_rate: std::env::var("SAMPLE_RATE")
                .unwrap_or_else(|_| "48000".to_string())
                .parse()?,
            channels: std::env::var("CHANNELS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()?,
            frame_size: std::env::var("FRAME_SIZE")
                .unwrap_or_else(|_| "960".to_string()) // 20ms @ 48kHz
                .parse()?,
            opus_bitrate: std::env::var("OPUS_BITRATE")
                .unwrap_or_else(|_| "96000".to_string()) // 96kbps (Discord default)
                .parse()?,

            // Límites del pipeline
            read_timeout_ms: std::env::var("READ_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
            ready_timeout_ms: std::env::var("READY_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
            send_timeout_ms: std::env::var("SEND_TIMEOUT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,

            // Supervisión de salud
            health_interval_ms: std::env::var("HEALTH_INTERVAL_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
            stale_threshold_ms: std::env::var("STALE_THRESHOLD_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,

            // Política de reinicios
            max_restarts: std::env::var("MAX_RESTARTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            restart_backoff_ms: std::env::var("RESTART_BACKOFF_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()?,

            // Barrido de sesiones inactivas
            idle_sweep_interval_ms: std::env::var("IDLE_SWEEP_INTERVAL_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()?,
            idle_threshold_ms: std::env::var("IDLE_THRESHOLD_MS")
                .unwrap_or_else(|_| "300000".to_string()) // 5 minutos
                .parse()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Performs sanity checks to catch common mistakes before any stream
    /// is started.
    ///
    /// # Validation Rules
    ///
    /// - Opus bitrate must stay within 8kbps..=510kbps
    /// - Sample rate must be one Opus supports
    /// - Channel count must be mono or stereo
    /// - Frame size and every timeout must be non-zero
    pub fn validate(&self) -> Result<()> {
        if self.opus_bitrate > 510_000 {
            anyhow::bail!(
                "Opus bitrate cannot exceed 510kbps, got: {}",
                self.opus_bitrate
            );
        }

        if self.opus_bitrate < 8_000 {
            anyhow::bail!(
                "Opus bitrate too low, minimum 8kbps, got: {}",
                self.opus_bitrate
            );
        }

        if !matches!(self.sample_rate, 8_000 | 12_000 | 16_000 | 24_000 | 48_000) {
            anyhow::bail!("Unsupported sample rate: {}", self.sample_rate);
        }

        if !matches!(self.channels, 1 | 2) {
            anyhow::bail!("Channel count must be 1 or 2, got: {}", self.channels);
        }

        if self.frame_size == 0 {
            anyhow::bail!("Frame size must be greater than 0");
        }

        if self.read_timeout_ms == 0
            || self.ready_timeout_ms == 0
            || self.send_timeout_ms == 0
            || self.health_interval_ms == 0
            || self.stale_threshold_ms == 0
        {
            anyhow::bail!("Pipeline timeouts must be greater than 0");
        }

        if self.idle_sweep_interval_ms == 0 || self.idle_threshold_ms == 0 {
            anyhow::bail!("Idle sweep settings must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Decoder: {} (reconnect: {})\n  \
            Audio: {}Hz x{}, {}kbps, {}ms frames\n  \
            Pipeline: read {}ms, ready {}ms, send {}ms\n  \
            Health: check {}ms, stale {}ms\n  \
            Restarts: max {}, backoff {}ms\n  \
            Idle: sweep {}s, threshold {}s",
            self.ffmpeg_path,
            self.reconnect,
            self.sample_rate,
            self.channels,
            self.opus_bitrate / 1000,
            self.frame_size as u64 * 1000 / self.sample_rate as u64,
            self.read_timeout_ms,
            self.ready_timeout_ms,
            self.send_timeout_ms,
            self.health_interval_ms,
            self.stale_threshold_ms,
            self.max_restarts,
            self.restart_backoff_ms,
            self.idle_sweep_interval_ms / 1000,
            self.idle_threshold_ms / 1000,
        )
    }

    /// Bytes de PCM s16le que ocupa exactamente un frame.
    pub fn block_bytes(&self) -> usize {
        self.frame_size * self.channels as usize * 2
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
/// These match Discord's native audio parameters.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Decoder defaults
            ffmpeg_path: "ffmpeg".to_string(),
            reconnect: true,

            // Audio defaults
            sample_rate: 48_000,
            channels: 2,
            frame_size: 960,      // 20ms at 48kHz
            opus_bitrate: 96_000, // 96kbps (Discord default)

            // Pipeline defaults
            read_timeout_ms: 5_000,
            ready_timeout_ms: 5_000,
            send_timeout_ms: 1_000,

            // Health defaults
            health_interval_ms: 5_000,
            stale_threshold_ms: 10_000,

            // Restart defaults
            max_restarts: 3,
            restart_backoff_ms: 500,

            // Idle defaults
            idle_sweep_interval_ms: 30_000,
            idle_threshold_ms: 300_000, // 5 minutos
        }
    }
}
