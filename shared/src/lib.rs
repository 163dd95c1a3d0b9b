pub mod key;
pub mod protocol;
pub mod types;
