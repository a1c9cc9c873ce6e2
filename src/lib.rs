//! Device access arbitration for laboratory instrument drivers.
//!
//! Serial ports, GPIB/VISA sessions and vendor libraries have no notion of
//! concurrent access, yet instrument control code calls them from many
//! threads at once: interactive commands, background polling loops and
//! emergency actions. This crate serializes those calls per device with a
//! priority-ordered admission queue and a gated-call protocol on top of it.
//!
//! # Modules
//!
//! - [`ticket`]: priorities and admission tickets
//! - [`queue`]: the admission queue and its lock guard
//! - [`gate`]: the guarded-call protocol
//! - [`device`]: device handles, the [`Driver`](device::Driver) trait and the wait hook
//! - [`channel`]: per-session prioritized accessors
//! - [`bridge`]: gated calls from tokio tasks
//! - [`config`], [`logging`], [`error`]: ambient plumbing
//! - [`mock`]: a simulated instrument for tests and demos

pub mod bridge;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod gate;
pub mod logging;
pub mod mock;
pub mod queue;
pub mod ticket;

pub use channel::Channel;
pub use device::{DeviceHandle, Driver};
pub use error::{AccessError, AccessResult};
pub use gate::{guarded_call, Gated};
pub use queue::{AdmissionQueue, SubmitMode};
pub use ticket::{Priority, Ticket};
