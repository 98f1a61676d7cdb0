use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::error::StreamError;

/// Resultado de leer un bloque de PCM del decodificador.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmBlock {
    /// El bloque llegó completo.
    Full,
    /// Fin de stream a mitad de bloque; el resto ya viene rellenado con
    /// silencio hasta el tamaño exacto del frame.
    Short(usize),
    /// El stream terminó sin más datos.
    Eof,
}

/// Proceso externo de decodificación que emite PCM s16le por stdout.
///
/// El stderr del proceso se drena en una tarea aparte para que el
/// decodificador nunca se bloquee escribiendo diagnósticos.
#[derive(Debug)]
pub struct DecodeProcess {
    child: Child,
    stdout: ChildStdout,
    read_timeout: Duration,
}

impl DecodeProcess {
    /// Lanza ffmpeg apuntando al locator ya resuelto.
    pub fn spawn(config: &Config, locator: &str) -> Result<Self, StreamError> {
        let mut cmd = Command::new(&config.ffmpeg_path);

        if config.reconnect {
            cmd.args([
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "5",
            ]);
        }

        cmd.args(["-hide_banner", "-loglevel", "warning", "-i", locator])
            .args(["-f", "s16le"])
            .args(["-ar", &config.sample_rate.to_string()])
            .args(["-ac", &config.channels.to_string()])
            .args(["-vn", "pipe:1"]);

        debug!("🎬 Lanzando decodificador para: {}", locator);
        Self::spawn_command(cmd, config.read_timeout())
    }

    /// Lanza un comando arbitrario que escribe PCM por stdout.
    pub(crate) fn spawn_command(
        mut cmd: Command,
        read_timeout: Duration,
    ) -> Result<Self, StreamError> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::Acquisition(format!("no se pudo lanzar el decodificador: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Acquisition("el decodificador no expone stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!("decodificador: {}", line);
                }
            });
        }

        Ok(Self {
            child,
            stdout,
            read_timeout,
        })
    }

    /// Lee exactamente un bloque de PCM, con espera acotada por lectura.
    ///
    /// Un bloque corto al final del stream se rellena con silencio hasta
    /// `buf.len()` para que el frame resultante nunca quede malformado.
    pub async fn read_block(&mut self, buf: &mut [u8]) -> Result<PcmBlock, StreamError> {
        let mut filled = 0;

        while filled < buf.len() {
            let read = tokio::time::timeout(self.read_timeout, self.stdout.read(&mut buf[filled..]))
                .await
                .map_err(|_| StreamError::ReadTimeout)??;

            if read == 0 {
                break;
            }
            filled += read;
        }

        if filled == buf.len() {
            Ok(PcmBlock::Full)
        } else if filled > 0 {
            buf[filled..].fill(0);
            Ok(PcmBlock::Short(filled))
        } else {
            Ok(PcmBlock::Eof)
        }
    }

    /// Termina el proceso y espera a que muera.
    pub async fn shutdown(mut self) {
        if self.child.start_kill().is_ok() {
            let _ = self.child.wait().await;
        }
    }
}

/// Convierte un bloque s16le en muestras entrelazadas.
pub fn pcm_to_samples(buf: &[u8]) -> Vec<i16> {
    buf.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Verifica que ffmpeg esté disponible en el sistema.
pub async fn verify_dependencies(config: &Config) -> anyhow::Result<()> {
    let check = Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await;

    match check {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            info!(
                "✅ ffmpeg disponible: {}",
                version.lines().next().unwrap_or("").trim()
            );
            Ok(())
        }
        _ => {
            error!("❌ ffmpeg no encontrado. Instala con: sudo apt install ffmpeg");
            anyhow::bail!("ffmpeg no disponible")
        }
    }
}
