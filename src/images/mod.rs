//! Generated-image handling: PNG encoding and the byte-capped store.

pub mod png;
pub mod store;

pub use png::encode_png;
pub use store::{ImageStore, StoredImage};
