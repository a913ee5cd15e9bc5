pub mod b_plus_tree;
pub mod common;
pub mod disk_management;
pub mod extendible_hashing;
