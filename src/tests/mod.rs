pub mod helpers;
pub mod test_checkpoint;
pub mod test_scope;
pub mod test_weighted;
