pub mod frame;
pub mod id;

pub use frame::{Frame, FrameCodec, FrameError, Op};
pub use id::PrefixedId;
