//! Minimal DRM device-node helpers.
//!
//! This adapter does not own a DRM display/mode-setting backend (that is the
//! host compositor's concern); it only needs to identify and open the render
//! node the X server's DRI3 `Open` request hands back, which is what
//! [`node::DrmNode`] and [`node::NodeType`] provide, and to issue timeline
//! syncobj ioctls against it through [`RenderDevice`].

pub mod node;

pub use node::{path_to_type, CreateDrmNodeError, DrmNode, NodeType};

use std::os::unix::io::{AsFd, BorrowedFd};

use crate::utils::fd::DeviceFd;

/// A render-node file descriptor, wrapped so it satisfies `drm-rs`'s
/// `Device`/`control::Device` traits.
///
/// Unlike a mode-setting device, a render node never needs DRM-master, so
/// this wrapper (unlike a primary-node device handle) does no privilege
/// negotiation on construction or drop.
#[derive(Debug, Clone)]
pub struct RenderDevice(DeviceFd);

impl RenderDevice {
    /// Wraps an already-open render-node file descriptor.
    pub fn new(fd: DeviceFd) -> Self {
        RenderDevice(fd)
    }

    /// Returns the underlying file descriptor handle.
    pub fn device_fd(&self) -> DeviceFd {
        self.0.clone()
    }
}

impl AsFd for RenderDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for RenderDevice {}
impl drm::control::Device for RenderDevice {}
