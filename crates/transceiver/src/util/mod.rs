//! Small single-threaded utilities shared by the port and reactor modules.
//!
//! Everything here is meant to live exclusively on the event loop thread —
//! none of it is `Send` or `Sync`, matching the thread-confinement of the
//! raw sockets it sits next to.

pub mod once_event;
pub mod slab_rc;

pub use once_event::OnceEvent;
pub use slab_rc::{SlabKey, SlabRc};
