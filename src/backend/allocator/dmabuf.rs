//! [dma-buf](https://docs.kernel.org/driver-api/dma-buf.html) handles: the
//! kernel-shared-memory objects that cross from the driver's GPU into a
//! shared pixmap, and (for PRIME offload) across GPUs.

use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Weak};

use crate::backend::drm::DrmNode;

use super::{Buffer, Format, Modifier};

pub(crate) const MAX_PLANES: usize = 4;

bitflags::bitflags! {
    /// Flags that describe how a dmabuf's planes are laid out.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DmabufFlags: u32 {
        /// The planes are not expected to be contiguous or ordered.
        const Y_INVERT = 1;
        /// The content is interlaced.
        const INTERLACED = 2;
        /// The bottom field is first in an interlaced buffer.
        const BOTTOM_FIRST = 4;
    }
}

#[derive(Debug)]
struct Plane {
    fd: OwnedFd,
    offset: u32,
    stride: u32,
}

#[derive(Debug)]
struct DmabufInternal {
    width: u32,
    height: u32,
    format: Format,
    flags: DmabufFlags,
    planes: Vec<Plane>,
    node: Option<DrmNode>,
}

/// A strong handle on an imported or exported dma-buf.
///
/// Cloning is cheap: it shares the underlying plane file descriptors, it
/// does not dup them.
#[derive(Debug, Clone)]
pub struct Dmabuf(Arc<DmabufInternal>);

/// Weak handle on a [`Dmabuf`].
#[derive(Debug, Clone)]
pub struct WeakDmabuf(Weak<DmabufInternal>);

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl Buffer for Dmabuf {
    fn size(&self) -> crate::utils::Size<i32, crate::utils::Buffer> {
        (self.0.width as i32, self.0.height as i32).into()
    }

    fn format(&self) -> Format {
        self.0.format
    }
}

impl Dmabuf {
    /// Starts building a dmabuf with the size and format of `buffer`.
    pub fn builder_from_buffer(buffer: &impl Buffer, flags: DmabufFlags) -> DmabufBuilder {
        let size = buffer.size();
        DmabufBuilder {
            width: size.w as u32,
            height: size.h as u32,
            format: buffer.format(),
            flags,
            planes: Vec::with_capacity(MAX_PLANES),
            node: None,
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.0.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.0.height
    }

    /// Number of planes backing this buffer.
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Raw handles of each plane, in plane order. Borrowed: callers that
    /// need to hand a plane's fd to another process (an X request, an
    /// `IMPORT_SYNC_FILE` ioctl) must `dup` it first.
    pub fn handles(&self) -> impl Iterator<Item = std::os::unix::io::RawFd> + '_ {
        use std::os::unix::io::AsRawFd;
        self.0.planes.iter().map(|p| p.fd.as_raw_fd())
    }

    /// Byte offset of each plane, in plane order.
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.offset)
    }

    /// Byte stride of each plane, in plane order.
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.stride)
    }

    /// Whether this buffer's format carries a vendor-specific modifier
    /// (neither `INVALID` nor `LINEAR`).
    pub fn has_modifier(&self) -> bool {
        !matches!(self.0.format.modifier, Modifier::Invalid | Modifier::Linear)
    }

    /// The render node this buffer was allocated or exported from, if known.
    pub fn node(&self) -> Option<DrmNode> {
        self.0.node
    }

    /// Downgrades to a [`WeakDmabuf`].
    pub fn weak(&self) -> WeakDmabuf {
        WeakDmabuf(Arc::downgrade(&self.0))
    }
}

impl WeakDmabuf {
    /// Attempts to upgrade back to a strong [`Dmabuf`].
    pub fn upgrade(&self) -> Option<Dmabuf> {
        self.0.upgrade().map(Dmabuf)
    }
}

/// Incrementally assembles a [`Dmabuf`] one plane at a time.
#[derive(Debug)]
pub struct DmabufBuilder {
    width: u32,
    height: u32,
    format: Format,
    flags: DmabufFlags,
    planes: Vec<Plane>,
    node: Option<DrmNode>,
}

impl DmabufBuilder {
    /// Appends a plane. `idx` must match the order GBM reported the plane
    /// in; this builder does not reorder by `idx`, it trusts call order.
    pub fn add_plane(&mut self, fd: OwnedFd, _idx: u32, offset: u32, stride: u32) -> bool {
        if self.planes.len() >= MAX_PLANES {
            return false;
        }
        self.planes.push(Plane { fd, offset, stride });
        true
    }

    /// Records which render node this buffer came from.
    pub fn set_node(&mut self, node: DrmNode) {
        self.node = Some(node);
    }

    /// Finishes the buffer. Fails only if no planes were ever added.
    pub fn build(self) -> Option<Dmabuf> {
        if self.planes.is_empty() {
            return None;
        }
        Some(Dmabuf(Arc::new(DmabufInternal {
            width: self.width,
            height: self.height,
            format: self.format,
            flags: self.flags,
            planes: self.planes,
            node: self.node,
        })))
    }
}

/// A buffer type that can be exported as a [`Dmabuf`].
pub trait AsDmabuf {
    /// Error returned if the export fails.
    type Error;

    /// Exports this buffer's planes as a dmabuf.
    fn export(&self) -> Result<Dmabuf, Self::Error>;
}

impl AsDmabuf for Dmabuf {
    type Error = std::convert::Infallible;

    fn export(&self) -> Result<Dmabuf, Self::Error> {
        Ok(self.clone())
    }
}
