//! DSC Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the data-space connector
//! workspace.
//!
//! # Overview
//!
//! - **Types**: transfer identifiers, lifecycle states, checkpoints and
//!   failure causes shared by the transfer library and the host process
//! - **Checksums**: SHA-256 digests recorded with chunk checkpoints
//! - **Logging**: tracing subscriber setup driven by `LOG_*` variables
//! - **Error Handling**: [`DscError`] and the crate [`Result`] alias
//!
//! # Example
//!
//! ```no_run
//! use dsc_common::types::{TransferId, TransferState};
//!
//! let id = TransferId::new("tp-0001");
//! let state: TransferState = "streaming".parse().unwrap();
//! assert!(state.can_transition_to(TransferState::Paused));
//! println!("{id} is {state}");
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{DscError, Result};
