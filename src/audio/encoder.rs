use audiopus::{coder::Encoder, Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tracing::debug;

use crate::config::Config;
use crate::error::StreamError;

/// Tamaño máximo de un paquete Opus (1275 bytes a 510kbps por 20ms).
const MAX_OPUS_PACKET: usize = 1500;

/// Convierte bloques de PCM entrelazado en frames Opus de duración fija.
pub struct FrameEncoder {
    encoder: Encoder,
    frame_size: usize,
    channels: usize,
}

impl FrameEncoder {
    pub fn new(config: &Config) -> Result<Self, StreamError> {
        let sample_rate = match config.sample_rate {
            8_000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            48_000 => SampleRate::Hz48000,
            other => {
                return Err(StreamError::Encode(format!(
                    "sample rate no soportado por Opus: {other}"
                )))
            }
        };
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(StreamError::Encode(format!(
                    "número de canales no soportado: {other}"
                )))
            }
        };

        let mut encoder = Encoder::new(sample_rate, channels, Application::Audio)
            .map_err(|e| StreamError::Encode(e.to_string()))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(config.opus_bitrate as i32))
            .map_err(|e| StreamError::Encode(e.to_string()))?;

        debug!(
            "🎛️ Encoder Opus listo: {}Hz x{} @ {}kbps",
            config.sample_rate,
            config.channels,
            config.opus_bitrate / 1000
        );

        Ok(Self {
            encoder,
            frame_size: config.frame_size,
            channels: config.channels as usize,
        })
    }

    /// Muestras entrelazadas que ocupa exactamente un frame.
    pub fn samples_per_block(&self) -> usize {
        self.frame_size * self.channels
    }

    /// Codifica un bloque completo de PCM en un frame Opus.
    ///
    /// El bloque debe traer exactamente [`Self::samples_per_block`] muestras;
    /// los bloques cortos se rellenan con silencio antes de llegar aquí.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, StreamError> {
        if pcm.len() != self.samples_per_block() {
            return Err(StreamError::Encode(format!(
                "bloque de {} muestras, se esperaban {}",
                pcm.len(),
                self.samples_per_block()
            )));
        }

        let mut packet = vec![0u8; MAX_OPUS_PACKET];
        let written = self
            .encoder
            .encode(pcm, &mut packet)
            .map_err(|e| StreamError::Encode(e.to_string()))?;
        packet.truncate(written);

        Ok(Bytes::from(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_silence_block() {
        let config = Config::default();
        let mut encoder = FrameEncoder::new(&config).unwrap();

        let silence = vec![0i16; encoder.samples_per_block()];
        let frame = encoder.encode(&silence).unwrap();

        assert!(!frame.is_empty());
        assert!(frame.len() <= MAX_OPUS_PACKET);
    }

    #[test]
    fn test_encode_rejects_wrong_block_size() {
        let config = Config::default();
        let mut encoder = FrameEncoder::new(&config).unwrap();

        let short = vec![0i16; 10];
        assert!(matches!(
            encoder.encode(&short),
            Err(StreamError::Encode(_))
        ));
    }

    #[test]
    fn test_mono_encoder() {
        let mut config = Config::default();
        config.channels = 1;
        let mut encoder = FrameEncoder::new(&config).unwrap();

        assert_eq!(encoder.samples_per_block(), 960);
        let silence = vec![0i16; 960];
        assert!(encoder.encode(&silence).is_ok());
    }
}
