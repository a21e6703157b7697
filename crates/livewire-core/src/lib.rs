//! The core crate for shared code used in the livewire system.
//!
//! Everything here is pure data: the render tree produced by a template,
//! the sparse diff between two trees, and the JSON frame protocol spoken
//! between the server and the browser client. No I/O happens in this crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rand::distributions::Alphanumeric;
use rand::Rng;

pub mod protocol;
pub mod template;
pub mod tree;

// Re-export commonly used types.
pub use protocol::{ClientFrame, EventData, ServerFrame};
pub use template::{Template, TemplateError, TemplateSet};
pub use tree::{diff, Diff, Dynamic, PatchValue, RenderTree, TreePatch};

/// Returns a cryptographically-random alphanumeric string.
///
/// Each character carries about 5.95 bits of entropy, so 14 characters are
/// enough for an unguessable session identifier.
pub fn rand_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
