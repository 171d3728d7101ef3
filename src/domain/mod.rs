pub mod battery;
pub mod device;
pub mod types;

pub use battery::*;
pub use device::*;
pub use types::*;
