pub mod event;
pub mod stats;
