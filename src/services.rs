//! Collaborators shared by the thumbnail loader and the maintenance engine.

use crate::decode::Decoder;
use crate::events::EventSink;
use crate::filestore::FileStore;
use crate::persistence::Persistence;
use crate::report::ErrorReporter;
use crate::state::SharedState;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub persistence: Arc<dyn Persistence>,
    pub files: Arc<dyn FileStore>,
    pub decoder: Arc<dyn Decoder>,
    pub state: Arc<SharedState>,
    pub events: EventSink,
    pub reporter: Arc<ErrorReporter>,
}

impl Services {
    /// Services with fresh activity flags and no event receiver.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        files: Arc<dyn FileStore>,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        Self {
            persistence,
            files,
            decoder,
            state: Arc::new(SharedState::new()),
            events: EventSink::disconnected(),
            reporter: Arc::new(ErrorReporter::default()),
        }
    }

    /// Route events (and first-time error reports) to `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.reporter = Arc::new(ErrorReporter::new(events.clone()));
        self.events = events;
        self
    }

    pub fn with_state(mut self, state: Arc<SharedState>) -> Self {
        self.state = state;
        self
    }
}
