pub mod rid;
pub mod rw_latch;
pub mod transaction;
