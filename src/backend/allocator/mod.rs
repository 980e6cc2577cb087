//! Buffer allocation: DRM format/modifier tables, dma-buf conversion and the
//! GBM allocator used to back the color-buffer pool.

pub mod dmabuf;
pub mod gbm;

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

use crate::utils::{Buffer as BufferCoords, Size};

/// A buffer with a known size and pixel format, sufficient to import it as a
/// shared pixmap or wrap it in a dmabuf.
pub trait Buffer {
    /// Size of the buffer in pixels.
    fn size(&self) -> Size<i32, BufferCoords>;

    /// Format (fourcc code and modifier) this buffer was allocated with.
    fn format(&self) -> Format;
}

/// Something that can allocate buffers with a given format and one of a set
/// of acceptable modifiers.
pub trait Allocator {
    /// The buffer type this allocator produces.
    type Buffer: Buffer;
    /// The error type returned on allocation failure.
    type Error: std::error::Error;

    /// Allocates a buffer of `width` x `height` in `fourcc`, using whichever
    /// of `modifiers` the allocator can satisfy.
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error>;
}
