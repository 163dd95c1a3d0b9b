use serde::Serialize;

/// Events emitted while a sync runs, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncProgress {
    RegionStarted { region: String },
    FetchingFolder { region: String, path: String },
    FolderFailed { region: String, path: String, error: String },
    DiffComputed { region: String, total_found: usize, new_count: usize },
    Committed { region: String, added: usize },
    RegionFailed { region: String, error: String },
}

/// Optional receiver of progress events. Sending never blocks and a dropped
/// receiver is ignored.
#[derive(Clone, Default)]
pub struct ProgressSink(Option<flume::Sender<SyncProgress>>);

impl ProgressSink {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn channel() -> (Self, flume::Receiver<SyncProgress>) {
        let (tx, rx) = flume::unbounded();
        (Self(Some(tx)), rx)
    }

    pub fn emit(&self, event: SyncProgress) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
