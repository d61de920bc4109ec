//! # orbit-core — Replicated document primitives for Orbit
//!
//! The merge algorithm is treated as a black box behind the
//! [`ReplicatedDocument`] capability; [`YrsDocument`] implements it with
//! `yrs`. Every applied delta carries an [`Origin`] so that synchronization
//! channels can suppress their own echo.
//!
//! ## Modules
//!
//! - [`document`] — capability trait and the `yrs` implementation
//! - [`origin`] — origin tags carried through transactions
//! - [`text_diff`] — minimal single-region text replacement

pub mod document;
pub mod error;
pub mod origin;
pub mod text_diff;

pub use document::{ReplicatedDocument, YrsDocument};
pub use error::DocumentError;
pub use origin::Origin;
pub use text_diff::{diff, TextEdit};

// Consumers mutate handles through the same `yrs` version.
pub use yrs;
