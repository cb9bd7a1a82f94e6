//! Projection core: sequencing decisions and the event-to-row projector
//!
//! Both halves are pure. The ingest loop reads persisted state, asks
//! `sequence::decide` what to do, and on `Apply` asks `projector::project`
//! for the new row before handing it to the view store.

pub mod projector;
pub mod sequence;
pub mod view;

pub use projector::{project, ApplyToView, ProjectionError};
pub use sequence::{decide, SequenceDecision};
pub use view::{LineItem, OrderStatus, OrderView};
