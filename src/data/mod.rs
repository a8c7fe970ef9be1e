pub mod buffer;
pub mod collector;
pub mod sink;
pub mod value;
