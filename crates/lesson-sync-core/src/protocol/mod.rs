//! Wire protocol for lesson sync.
//!
//! Each message is one JSON object followed by a single `\n`:
//!
//! ```text
//! {"type":"USERNAME","data":"alice"}\n{"type":"METADATA","data":[...]}\n
//! ```
//!
//! - [`message`]: the typed `{type, data}` envelope
//! - [`framing`]: splitting a byte stream back into lines

pub mod framing;
pub mod message;

pub use framing::{LineBuffer, MAX_LINE_LEN};
pub use message::{DecodeError, SyncMessage};
