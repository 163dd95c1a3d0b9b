pub mod fetcher;
pub mod walker;
