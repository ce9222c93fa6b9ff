pub mod constants;
pub mod fees;
mod push_bytes;
mod sha256;
#[cfg(test)]
pub mod test_utils;

pub use push_bytes::{bytes_to_push_bytes, push_chunks};
pub use sha256::{sha256sum, sha256sum_hex};
