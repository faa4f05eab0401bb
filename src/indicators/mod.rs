// Rolling statistics over spread samples
pub mod rolling;

pub use rolling::{mean, quantile, sample_std_dev, RollingWindow};
