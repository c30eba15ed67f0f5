//! In-flight acknowledgment tracking and graceful drain for broker consumers.
//!
//! A [`Consumer`] owns one channel subscription. Each delivery runs through a
//! [`DeliveryPipeline`], which registers the tag with the [`DeliveryTracker`],
//! hands the message to a [`Downstream`] and settles it according to the
//! [`AcknowledgeMode`]. [`Consumer::stop_consumer`] drives the
//! [`DrainCoordinator`], which waits a bounded time for outstanding work before
//! closing the channel and connection.

mod completion;
mod consumer;
mod downstream;
mod drain;
mod errors;
mod in_flight;
mod pipeline;
mod policy;
mod settings;
mod tracker;

pub use completion::{Acknowledger, Completer, CompletionHandle, completion};
pub use consumer::Consumer;
pub use downstream::{Downstream, Job};
pub use drain::{DrainCoordinator, DrainReport, DrainSettings, ShutdownState};
pub use errors::{ConsumerError, DispatchError};
pub use in_flight::InFlight;
pub use pipeline::{ConsumerContext, DeliveryPipeline, Settlement};
pub use policy::{AcknowledgeMode, Decision, Outcome, decide};
pub use settings::{ConsumerSettings, load_settings};
pub use tracker::DeliveryTracker;
