mod server;
mod handler;

pub use server::*;
pub use handler::*;

pub const MAX_BODY_SIZE: usize = 1024 * 1024; // 1MB
