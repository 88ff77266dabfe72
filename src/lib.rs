//! Experiment run recording.
//!
//! Each run gets a folder under a root, keyed by a time-ordered id, holding a
//! JSON metadata record, mirrored stdout/stderr logs, a source snapshot, the
//! package list, scalar series, images and a free-form files area. A run is
//! driven through [`Run`] (or the scoped [`record`]); listing, editing and
//! diffing read the same folders afterwards.

pub mod config;
pub mod diff;
pub mod edit;
pub mod environment;
pub mod error;
pub mod events;
pub mod id;
pub mod images;
pub mod layout;
pub mod listing;
pub mod mirror;
pub mod record;
pub mod recorder;
pub mod scalars;
pub mod snapshot;
pub mod store;

pub use config::ExprecConfig;
pub use error::{ExprecError, Result};
pub use events::{EventSink, RunEvent};
pub use id::RunId;
pub use layout::RunPaths;
pub use listing::{RunSummary, TagFilter};
pub use mirror::StdStreams;
pub use record::{ParamValue, RunRecord, RunStatus};
pub use recorder::{record, Failure, Finished, Interrupted, Report, Run, RunOptions};
