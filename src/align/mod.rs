pub mod dedup;
pub mod nearest;
pub mod pipeline;
