pub mod events;
pub mod frames;
pub mod id;

pub use frames::{ControlFrame, FrameError, ServerFrame};
pub use id::PrefixedId;
