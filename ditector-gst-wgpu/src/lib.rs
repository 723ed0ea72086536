pub mod context;
pub mod effect;
pub mod layout;

use gst::glib;
extern crate gstreamer as gst;

pub use context::{WgpuContext, GST_CONTEXT_WGPU_TYPE};
pub use effect::{Effect, FrameTargets, Readback, INVERT_WGSL};
