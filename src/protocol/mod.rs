//! Protocol module - text frame grammar and the pieces built on it.
//!
//! - CRLF-framed start line + headers + `End:` sentinel + optional body
//! - Incremental decoder tolerant of arbitrary fragmentation
//! - Verbs, selectors, and Rabbitmap menu bodies

mod frame;
mod frame_buffer;
mod rabbitmap;
mod selector;
mod verb;

pub use frame::{headers, ChunkPart, Frame, StartLine};
pub use frame_buffer::FrameBuffer;
pub use rabbitmap::{decode_menu, encode_menu, MapEntry, SAME_BURROW};
pub use selector::{ItemType, RabbitUri, Selector, WARREN_SELECTOR};
pub use verb::Verb;
