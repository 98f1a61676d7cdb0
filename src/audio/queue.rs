use chrono::{DateTime, Utc};
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use crate::error::QueueError;
use crate::ids::UserId;

/// Metadatos opcionales de un item de cola.
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    /// Referencia original (la URL que escribió el usuario).
    pub source_url: Option<String>,
    /// Identificador del track en su plataforma de origen.
    pub track_id: Option<String>,
    /// Duración precalculada por el resolvedor.
    pub duration: Option<Duration>,
}

/// Un item ya resuelto, listo para reproducirse. Inmutable una vez creado.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Locator reproducible directamente por el decodificador.
    pub locator: String,
    pub title: String,
    pub requested_by: UserId,
    pub requested_at: DateTime<Utc>,
    pub source_url: Option<String>,
    pub track_id: Option<String>,
    pub duration: Option<Duration>,
}

impl QueueItem {
    pub fn new(
        locator: impl Into<String>,
        title: impl Into<String>,
        requested_by: UserId,
    ) -> Self {
        Self {
            locator: locator.into(),
            title: title.into(),
            requested_by,
            requested_at: Utc::now(),
            source_url: None,
            track_id: None,
            duration: None,
        }
    }

    pub fn with_metadata(mut self, meta: TrackMetadata) -> Self {
        self.source_url = meta.source_url;
        self.track_id = meta.track_id;
        self.duration = meta.duration;
        self
    }
}

/// Cola FIFO de items pendientes más el item en curso.
///
/// No impone tope de tamaño; si hace falta acotar la cola, esa política vive
/// en la capa que llama.
#[derive(Debug, Default)]
pub(crate) struct PlayQueue {
    items: VecDeque<QueueItem>,
    current: Option<QueueItem>,
}

impl PlayQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Agrega un item al final de la cola.
    pub(crate) fn add(&mut self, item: QueueItem) {
        info!("➕ Agregado a la cola: {}", item.title);
        self.items.push_back(item);
    }

    /// Saca el primer item y lo marca como actual.
    ///
    /// Con la cola vacía devuelve `None` sin tocar el item actual.
    pub(crate) fn next(&mut self) -> Option<QueueItem> {
        let item = self.items.pop_front()?;
        info!("➡️ Siguiente en cola (FIFO): {}", item.title);
        self.current = Some(item.clone());
        Some(item)
    }

    /// Elimina exactamente el item en `index`, sin alterar el orden relativo
    /// del resto.
    pub(crate) fn remove(&mut self, index: usize) -> Result<QueueItem, QueueError> {
        if index >= self.items.len() {
            return Err(QueueError::IndexOutOfRange {
                index,
                size: self.items.len(),
            });
        }

        let removed = self
            .items
            .remove(index)
            .expect("índice validado contra el tamaño");
        debug!("❌ Track eliminado en posición {}: {}", index, removed.title);
        Ok(removed)
    }

    /// Vacía la cola y olvida el item actual.
    pub(crate) fn clear(&mut self) {
        self.items.clear();
        self.current = None;
        info!("🗑️ Cola limpiada");
    }

    pub(crate) fn list(&self) -> Vec<QueueItem> {
        self.items.iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn current(&self) -> Option<&QueueItem> {
        self.current.as_ref()
    }

    pub(crate) fn clear_current(&mut self) {
        self.current = None;
    }

    pub(crate) fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.clone(),
            items: self.list(),
            total_items: self.items.len(),
            total_duration: self.total_duration(),
        }
    }

    fn total_duration(&self) -> Duration {
        let queued: Duration = self.items.iter().filter_map(|item| item.duration).sum();
        let current = self
            .current
            .as_ref()
            .and_then(|c| c.duration)
            .unwrap_or_default();
        queued + current
    }
}

/// Vista de solo lectura de la cola de un guild.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<QueueItem>,
    pub items: Vec<QueueItem>,
    pub total_items: usize,
    pub total_duration: Duration,
}

impl QueueSnapshot {
    /// Obtiene una página específica de la cola.
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let safe_page = page.max(1);
        let start = (safe_page - 1) * items_per_page;
        let end = (start + items_per_page).min(self.items.len());
        let total_pages = if self.total_items == 0 {
            1
        } else {
            self.total_items.div_ceil(items_per_page)
        };

        QueuePage {
            items: if start < self.items.len() {
                self.items[start..end].to_vec()
            } else {
                Vec::new()
            },
            current_page: safe_page,
            total_pages,
            total_items: self.total_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<QueueItem>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
