pub mod mem;
pub mod stress;

pub use mem::MemSampler;
