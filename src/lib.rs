#![warn(missing_debug_implementations, rust_2018_idioms)]
#![allow(clippy::upper_case_acronyms)]

//! # x11-platform-adapter
//!
//! Window-system-integration adapter that plugs into a host GPU driver's
//! external-platform entry point and presents driver-rendered images on an
//! X11 display server speaking the DRI3 and Present extensions.
//!
//! This crate implements only the per-window presentation engine: buffer
//! pool management, swap-chain progression, explicit/implicit/finish-fallback
//! fence synchronization, event-driven state transitions, and the optional
//! PRIME (cross-GPU) indirect presentation path. It does not implement a
//! driver entry-point loader, color-format enumeration, `EGLConfig`
//! translation, pixmap surfaces, or an Xlib-vs-XCB wrapper; those are
//! external collaborators represented only by the trait boundaries in
//! [`external`].
//!
//! ## Structure
//!
//! - [`config`] — environment-variable configuration, read once at display
//!   setup.
//! - [`error`] — the error enums surfaced through the driver's error
//!   channel.
//! - [`backend::allocator`] — DRM format/modifier tables, dma-buf handling
//!   and GBM buffer allocation.
//! - [`backend::drm`] — DRM render-node identification.
//! - [`backend::x11`] — the presentation engine: format catalog, timeline
//!   sync objects, the color-buffer pool, the Present event pump, the
//!   swap-chain state machine, and the driver-callback surface. With the
//!   `event_source` feature (on by default), also a calloop event source for
//!   consumers that want the Present event pump fed from a background
//!   thread instead of polling it themselves.
//! - [`external`] — narrow interfaces for the collaborators this crate does
//!   not implement.

pub mod backend;
pub mod config;
pub mod error;
pub mod external;
pub mod utils;

pub use backend::x11::{DisplayInstance, WindowSurface};
pub use config::Config;
pub use error::AdapterError;
