// Guest virtual addresses are carried as `u64` everywhere; on 64-bit hosts a
// lot of the address math ends up as u64-to-u64 casts which Clippy dislikes.
#![allow(clippy::useless_conversion)]

pub mod errors;
pub mod handles;
pub mod ipc;
pub mod memory;
pub mod mstring;
pub mod pe;
pub mod system;
pub mod usched;

pub use errors::OsStatus;
pub use mstring::MString;
