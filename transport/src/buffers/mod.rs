pub mod buffer_pool;
pub mod seq_window;
