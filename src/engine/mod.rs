pub mod group;
pub mod node;
pub mod scheduler;
