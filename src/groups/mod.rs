pub mod group;
pub mod manager;

pub use group::DeviceGroup;
pub use manager::{Assignment, GroupManager, GroupSummary, ALL_DEVICES};
