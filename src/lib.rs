pub mod assign;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod ops;
pub mod scope;
pub mod store;
pub mod tracker;
pub mod weighted;

#[cfg(test)]
pub mod tests;
