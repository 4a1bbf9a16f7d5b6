mod shared_size;

pub use shared_size::array_bytes;
pub use shared_size::batch_bytes;
