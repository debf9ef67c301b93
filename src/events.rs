//! Notifications emitted towards the UI layer.
//!
//! Events go out over a crossbeam channel. A sink without a receiver (or whose
//! receiver was dropped) silently discards, so background loops never block or
//! fail on a UI that went away.

use crate::jobs::JobKind;
use crate::media::MediaId;
use crate::report::ReportCategory;
use crossbeam_channel::{Receiver, Sender};

/// Token for one page of visible thumbnails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey(pub u64);

/// Which cache flavor an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFlavor {
    Thumbnails,
    Renders,
    Tiles,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// One batch per page per waterfall tick
    ThumbnailsRendered { page: PageKey, media: Vec<MediaId> },
    /// A delayed correction replaced a thumbnail on disk
    ThumbnailRegenerated { media: MediaId },
    /// Coarse progress of a forced maintenance drain
    MaintenanceProgress {
        kind: Option<JobKind>,
        done: usize,
        total: usize,
    },
    MaintenanceBacklogChanged,
    MaintenancePassFinished { jobs_done: usize },
    CacheCleared { flavor: CacheFlavor },
    /// First occurrence of an error category this process run
    ErrorReported {
        category: ReportCategory,
        message: String,
    },
}

/// Cheap cloneable handle for emitting events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<Event>>,
}

impl EventSink {
    /// Sink plus the receiver the UI should drain.
    pub fn channel() -> (Self, Receiver<Event>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that drops everything
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("event receiver gone, dropping event");
            }
        }
    }
}
