//! Concurrency limits for calling a rate-limited API whose remaining quota is only known from
//! each response.
//!
//! A [Gate] admits at most `capacity` concurrent callers. Each caller reports the points the
//! upstream said were left when releasing its [Token]; once that [Balance] drops to or below the
//! threshold, the gate stops admitting anyone until the upstream has had time to refill.

mod balance;
mod config;
mod error;
mod gate;

pub use balance::{Balance, SENTINEL};
pub use config::{GateBuilder, GateConfig, DEFAULT_ACQUIRE_BUFFER, DEFAULT_PAUSE_BUFFER};
pub use error::{AcquireError, ConfigError};
pub use gate::{Gate, GateState, Token};
