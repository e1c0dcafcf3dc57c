mod condition;
mod volume_replication;
mod volume_replication_group;

pub use condition::*;
pub use volume_replication::*;
pub use volume_replication_group::*;
