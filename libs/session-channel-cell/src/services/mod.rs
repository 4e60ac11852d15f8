pub mod hub;
pub mod publisher;

pub use hub::*;
pub use publisher::*;
