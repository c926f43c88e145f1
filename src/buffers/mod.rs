pub mod message_pool;

pub use message_pool::MessagePool;
