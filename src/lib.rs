//! # Telecommand Dispatch Core
//!
//! The telecommand routing and command-dispatch engine of a satellite
//! on-board computer: packets arrive over a point-to-point transport, get
//! classified by destination port, and are either queued for a service
//! task or executed by the general command interpreter.
//!
//! ## Architecture
//!
//! - [`router`] - Accept loop that demultiplexes packets into per-service
//!   queues or the transport's built-in handler
//! - [`general`] - General Command Interpreter: reboot, task delay
//!   get/set, task listing, stack watermark
//! - [`queues`] - Bounded per-service FIFOs with bounded-wait enqueue
//! - [`packet`] - Command packet buffer and the byte-exact wire layout
//! - [`subservice`] - Subservice codes and command decoding
//! - [`bridge`] - The narrow scheduler interface (and a simulated one)
//! - [`link`] - Transport primitives: framed packets over TCP with
//!   bounded-wait accept/read
//!
//! ## Quick Start
//!
//! ```rust
//! use tcbus::bridge::{SimScheduler, TaskId};
//! use tcbus::general::GeneralService;
//! use tcbus::subservice::GeneralCommand;
//!
//! let mut service = GeneralService::new(SimScheduler::with_flight_tasks());
//!
//! let mut packet = GeneralCommand::GetTaskDelay { task: TaskId(2) }
//!     .to_request()
//!     .unwrap();
//! service.execute(&mut packet).unwrap();
//! assert_eq!(packet.status(), Some(0));
//! ```

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod bridge;
pub mod general;
pub mod link;
pub mod packet;
pub mod queues;
pub mod router;
pub mod subservice;

// Re-export the main public types for convenience
pub use bridge::{SimScheduler, TaskBridge, TaskDescriptor, TaskId};
pub use general::{CommandOutcome, GeneralService, ServiceError};
pub use packet::{CmdPacket, ServicePort};
pub use queues::{service_queues, QueueError, ServiceQueueSet};
pub use router::Router;
pub use subservice::{GeneralCommand, RebootPartition, Subservice};
