pub mod forward_filter;
pub mod pixel_control;
pub mod running_mean;

pub use forward_filter::{ForwardFilter, RewardScaler};
pub use pixel_control::{PixelRange, pixel_control_target, pixel_rewards};
pub use running_mean::RunningMeanStd;
