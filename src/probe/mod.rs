pub mod socket;
pub mod wire;

pub use socket::*;
pub use wire::*;
