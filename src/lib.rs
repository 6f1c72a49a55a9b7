mod vsfs_lib;

pub use vsfs_lib::*;
