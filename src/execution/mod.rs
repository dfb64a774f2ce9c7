//! Pipeline execution engine

pub mod cancel;
pub mod checkout;
pub mod engine;
pub mod executor;
pub mod gate;
mod tracker;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use checkout::{CheckoutError, GitCheckout, SourceCheckout};
pub use engine::{EventHandler, PipelineRunner, RunEvent, RunHandle};
pub use executor::{OutputBuffer, ProcessOutcome, StageExecutor, TRUNCATION_MARKER};
pub use gate::{AppReservation, ConcurrencyGate, GateError, GatePass};
