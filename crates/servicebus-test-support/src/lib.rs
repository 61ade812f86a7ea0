//! Shared test doubles and utilities for the service bus kernel.

mod clock;
mod context;
mod handler;

pub use clock::{FixedClock, ManualClock};
pub use context::{FailingDeliveryContext, PublishedMessage, RecordingDeliveryContext};
pub use handler::{FailingHandler, FlakyHandler};
