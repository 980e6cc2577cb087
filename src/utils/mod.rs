//! Small utilities shared across the crate: coordinate/size types, a file
//! descriptor wrapper, and wrap-aware serial arithmetic.

mod geometry;
pub mod fd;
pub mod serial;

pub use self::geometry::{Buffer, Coordinate, Logical, Size};

/// The native window this surface was created for has been destroyed.
#[derive(Debug)]
pub struct DeadResource;

impl std::fmt::Display for DeadResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("the native resource backing this object no longer exists")
    }
}

impl std::error::Error for DeadResource {}
