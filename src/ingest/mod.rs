pub mod hasher;
pub mod hashes;
