pub mod constraints;
pub mod fallback;
pub mod milp;
pub mod types;

pub use constraints::*;
pub use fallback::*;
pub use milp::*;
pub use types::*;
