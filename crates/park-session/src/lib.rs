pub mod controller;
pub mod error;
pub mod sink;
pub mod source;
pub mod state;
pub mod stats;

pub use controller::{ControllerConfig, DetectorFactory, SessionController, StateHandle};
pub use error::SessionError;
pub use sink::{EventSink, StatsSink};
pub use source::{FrameSource, SourceFactory};
pub use state::SessionState;

pub(crate) fn now_unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
