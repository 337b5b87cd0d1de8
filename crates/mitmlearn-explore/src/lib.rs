//! Executes learner queries against live peers through the interception layer.

pub mod driver;
pub mod encoder;
pub mod sut;

pub use driver::{DriverConfig, DriverError, SessionDriver, SessionOutcome};
pub use encoder::{ActionExecutor, EncoderConfig, EncoderError, InteractionEncoder, PointHandlers};
pub use sut::{NoSut, SutControl};
