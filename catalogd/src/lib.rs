pub mod daemon;
pub mod export;
pub mod mirror;
pub mod search;
pub mod sync;
