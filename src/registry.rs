//! # Session Registry
//!
//! Concurrency-safe map from guild identity to playback session, plus the
//! activity ledger and the idle reaper that reclaims transport and pipeline
//! resources after a period of inactivity.
//!
//! The registry is an explicit object injected into every consumer; there is
//! no process-wide mutable state. Entries are created on demand and never
//! removed: the reaper only resets a session logically and drops its ledger
//! entry.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::session::GuildSession;
use crate::config::Config;
use crate::ids::GuildId;

/// Registro de sesiones por guild con su libro de actividad.
pub struct SessionRegistry {
    sessions: DashMap<GuildId, Arc<GuildSession>>,
    activity: DashMap<GuildId, Instant>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            activity: DashMap::new(),
        }
    }

    /// Devuelve la sesión del guild, creándola si no existía.
    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<GuildSession> {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| Arc::new(GuildSession::new(guild_id)))
            .clone()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildSession>> {
        self.sessions.get(&guild_id).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registra actividad del guild; toda operación que toque la cola pasa
    /// por aquí.
    pub fn touch(&self, guild_id: GuildId) {
        self.activity.insert(guild_id, Instant::now());
    }

    pub fn last_activity(&self, guild_id: GuildId) -> Option<Instant> {
        self.activity.get(&guild_id).map(|entry| *entry.value())
    }

    /// Un barrido de inactividad: detiene y desconecta las sesiones que
    /// llevan más de `threshold` sin actividad y siguen reproduciendo.
    ///
    /// Devuelve cuántas sesiones se liberaron.
    pub async fn sweep(&self, threshold: Duration) -> usize {
        let due: Vec<GuildId> = self
            .activity
            .iter()
            .filter(|entry| entry.value().elapsed() >= threshold)
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;

        for guild_id in due {
            let Some(session) = self.get(guild_id) else {
                self.activity.remove(&guild_id);
                continue;
            };

            // La comprobación y el desenganche son una sola operación bajo
            // el lock de sesión, así el barrido no pisa un arranque en curso.
            let Some((pipeline, transport)) = session.begin_idle_stop() else {
                continue;
            };

            warn!("💤 Sesión inactiva en guild {}, liberando recursos", guild_id);

            if let Some(pipeline) = pipeline {
                pipeline.stop().await;
            }
            if let Some(transport) = transport {
                transport.disconnect().await;
            }

            self.activity.remove(&guild_id);
            reaped += 1;
        }

        if reaped > 0 {
            info!("🧹 Barrido de inactividad: {} sesiones liberadas", reaped);
        }

        reaped
    }

    /// Lanza la tarea periódica de barrido.
    ///
    /// El token devuelto la detiene; la tarea también termina sola si el
    /// proceso cancela el token desde cualquier otra parte.
    pub fn spawn_idle_reaper(
        self: &Arc<Self>,
        config: Arc<Config>,
    ) -> (JoinHandle<()>, CancellationToken) {
        let registry = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.idle_sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // El primer tick de un interval resuelve al instante.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("🧹 Barrido de inactividad detenido");
                        break;
                    }
                    _ = ticker.tick() => {
                        registry.sweep(config.idle_threshold()).await;
                    }
                }
            }
        });

        (handle, cancel)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
