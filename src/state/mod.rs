pub mod metrics;
pub mod window;

pub use metrics::*;
pub use window::*;
