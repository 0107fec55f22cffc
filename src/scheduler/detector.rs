//! Label transition detection.

use crate::db::UNKNOWN_LABEL;
use crate::probe::Snapshot;

/// Outcome of comparing a snapshot against the last known label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Endpoint is online and its label changed. `initial` is set when this
    /// is the first-ever observation, in which case there is no prior
    /// activity period to close.
    Transition { from: String, to: String, initial: bool },
    /// Endpoint is online with an unchanged label.
    NoChange,
    /// Endpoint did not answer; the previous label is left untouched so
    /// recovery resumes against the last known online state.
    Offline,
}

/// Pure comparison of the previous label against the current snapshot.
/// Label equality, not timestamp, is the sole transition signal, so
/// replaying the same snapshot never yields a second transition.
pub fn detect(previous_label: &str, snapshot: &Snapshot) -> Detection {
    if !snapshot.online {
        return Detection::Offline;
    }

    if snapshot.label == previous_label {
        return Detection::NoChange;
    }

    Detection::Transition {
        from: previous_label.to_string(),
        to: snapshot.label.clone(),
        initial: previous_label == UNKNOWN_LABEL,
    }
}
