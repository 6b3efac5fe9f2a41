//! Change tracking for plugin state.
//!
//! A state is a tree of objects, arrays and scalars. Writes go through
//! handles; each write made by navigating from the root is reported to a
//! [`ChangeListener`] with its path and the top-level property it touched.
//!
//! # Example
//!
//! ```ignore
//! let handle = StateHandle::new(name, defaults, listener);
//!
//! // `state.scores.alice = 3`
//! handle.field("scores").unwrap().set("alice", 3)?;
//!
//! // Reported as Change { path: "scores.alice", property: "scores", .. }
//! ```
//!
//! # Stale references
//!
//! A [`Tracked`] handle stays bound to the value it was taken from. Once
//! that value's slot is reassigned, writes through the old handle are no
//! longer reported.

mod handle;
mod node;

pub use handle::{ReadOnlyHandle, StateHandle, Tracked};
pub use node::{format_path, Change, ChangeListener, Segment};
