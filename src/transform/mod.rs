//! Frame transforms: the fixed-frame processing step of the pipeline.

pub mod frame_transform;
#[cfg(feature = "rnnoise")]
pub mod rnnoise;

pub use frame_transform::{
    FrameTransform, MockTransform, MockTransformProbe, PassthroughTransform, SharedTransform,
    TransformBackend, TransformConfig, TransformHandle, create_transform,
};
#[cfg(feature = "rnnoise")]
pub use rnnoise::RnnoiseTransform;
