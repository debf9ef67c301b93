//! Once-per-process error reporting.
//!
//! A failing drive can produce thousands of identical failures a minute. The
//! first failure of each category is surfaced to the user; every later one is
//! only logged.

use crate::events::{Event, EventSink};
use crate::jobs::JobKind;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportCategory {
    /// Local file without its thumbnail on disk
    MissingThumbnail,
    /// Thumbnail still undecodable after a regeneration
    PermanentCorruption,
    /// Storage-class failure; the maintenance engine is halted
    SystemicIo,
    /// Persistence has job records for files it has no metadata for
    DataIntegrity,
    /// A maintenance job of this kind failed for some file
    JobFailure(JobKind),
}

/// Latches one report per category.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    reported: Mutex<HashSet<ReportCategory>>,
    events: EventSink,
}

impl ErrorReporter {
    pub fn new(events: EventSink) -> Self {
        Self {
            reported: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Report `message` under `category`.
    ///
    /// Returns true if this was the first report of the category, in which
    /// case it was logged as an error and emitted as an event.
    pub fn report(&self, category: ReportCategory, message: &str) -> bool {
        let first = match self.reported.lock() {
            Ok(mut reported) => reported.insert(category),
            Err(poisoned) => poisoned.into_inner().insert(category),
        };

        if first {
            tracing::error!(?category, "{message}");
            self.events.emit(Event::ErrorReported {
                category,
                message: message.to_string(),
            });
        } else {
            tracing::warn!(?category, "{message}");
        }
        first
    }

    /// Log-only latch: true the first time, false afterwards. Nothing is emitted.
    pub fn first_time(&self, category: ReportCategory) -> bool {
        match self.reported.lock() {
            Ok(mut reported) => reported.insert(category),
            Err(poisoned) => poisoned.into_inner().insert(category),
        }
    }

    pub fn has_reported(&self, category: ReportCategory) -> bool {
        match self.reported.lock() {
            Ok(reported) => reported.contains(&category),
            Err(poisoned) => poisoned.into_inner().contains(&category),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_event_per_category() {
        let (sink, rx) = EventSink::channel();
        let reporter = ErrorReporter::new(sink);

        assert!(reporter.report(ReportCategory::SystemicIo, "disk gone"));
        assert!(!reporter.report(ReportCategory::SystemicIo, "disk still gone"));
        assert!(reporter.report(ReportCategory::JobFailure(JobKind::PixelHash), "bad"));
        assert!(reporter.report(ReportCategory::JobFailure(JobKind::Blurhash), "bad"));

        assert_eq!(rx.try_iter().count(), 3);
        assert!(reporter.has_reported(ReportCategory::SystemicIo));
    }

    #[test]
    fn test_first_time_latch() {
        let reporter = ErrorReporter::default();
        assert!(reporter.first_time(ReportCategory::MissingThumbnail));
        assert!(!reporter.first_time(ReportCategory::MissingThumbnail));
    }
}
