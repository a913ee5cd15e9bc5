pub mod extendible_hashing;
