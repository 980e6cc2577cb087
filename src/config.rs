//! Environment-variable configuration, read once per display instance.
//!
//! None of these are re-read after [`Config::from_env`] returns; the
//! adapter does not poll the environment at runtime.

use std::env;
use std::path::PathBuf;

/// Configuration knobs recognized by this adapter, sourced from the
/// environment at display-instance construction time.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Corresponds to `__NV_FORCE_ENABLE_X11_EGL_PLATFORM`. The full upstream
    /// meaning ("bypass the refusal to load this platform at all against an
    /// NV-GLX server") belongs to the out-of-scope driver entry-point loader
    /// (§1); the one piece of that decision this crate owns is whether to
    /// trust implicit sync against an NVIDIA render node, so `force_enable`
    /// here only overrides that one check.
    pub force_enable: bool,
    /// Permits choosing a renderer GPU different from the server's.
    /// Corresponds to `__NV_PRIME_RENDER_OFFLOAD`.
    pub prime_render_offload: bool,
    /// Forces a specific DRM device node as the renderer, overriding
    /// whatever `drm_node()` would otherwise select. Corresponds to
    /// `__NV_PRIME_RENDER_OFFLOAD_PROVIDER`.
    pub prime_render_offload_provider: Option<PathBuf>,
}

impl Config {
    /// Reads the recognized environment variables.
    ///
    /// `DISPLAY` itself is not captured here: resolving the default X
    /// display is the responsibility of the Xlib/XCB native-handle wrapper,
    /// which is outside this crate's scope.
    pub fn from_env() -> Self {
        Config {
            force_enable: env_flag("__NV_FORCE_ENABLE_X11_EGL_PLATFORM"),
            prime_render_offload: env_flag("__NV_PRIME_RENDER_OFFLOAD"),
            prime_render_offload_provider: env::var_os("__NV_PRIME_RENDER_OFFLOAD_PROVIDER")
                .map(PathBuf::from),
        }
    }
}

/// Matches the "nonzero string" truthiness used by the upstream driver:
/// unset or empty is false, `"0"` is false, anything else is true.
fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => !value.is_empty() && value != "0",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_is_false() {
        // SAFETY: test runs single-threaded with respect to this variable.
        unsafe { env::remove_var("__NV_PRIME_RENDER_OFFLOAD") };
        assert!(!env_flag("__NV_PRIME_RENDER_OFFLOAD"));
    }

    #[test]
    fn zero_is_false() {
        unsafe { env::set_var("__NV_FORCE_ENABLE_X11_EGL_PLATFORM", "0") };
        assert!(!env_flag("__NV_FORCE_ENABLE_X11_EGL_PLATFORM"));
        unsafe { env::remove_var("__NV_FORCE_ENABLE_X11_EGL_PLATFORM") };
    }

    #[test]
    fn nonzero_is_true() {
        unsafe { env::set_var("__NV_PRIME_RENDER_OFFLOAD", "1") };
        assert!(env_flag("__NV_PRIME_RENDER_OFFLOAD"));
        unsafe { env::remove_var("__NV_PRIME_RENDER_OFFLOAD") };
    }

    #[test]
    fn provider_path_is_captured() {
        unsafe { env::set_var("__NV_PRIME_RENDER_OFFLOAD_PROVIDER", "/dev/dri/renderD128") };
        let config = Config::from_env();
        assert_eq!(
            config.prime_render_offload_provider,
            Some(PathBuf::from("/dev/dri/renderD128"))
        );
        unsafe { env::remove_var("__NV_PRIME_RENDER_OFFLOAD_PROVIDER") };
    }
}
