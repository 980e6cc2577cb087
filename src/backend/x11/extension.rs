use crate::error::SetupError;

/// Generates an `Extensions` struct that checks for a set of X11 extensions
/// and records the negotiated version of each.
macro_rules! extensions {
    (
        $(
            $extension:ident {
                $extension_fn:ident,
                minimum: ($min_major:expr, $min_minor:expr),
                request: ($req_major:expr, $req_minor:expr),
            },
        )*
    ) => {
        #[derive(Debug, Copy, Clone)]
        pub struct Extensions {
            $(
                #[doc = concat!(" Negotiated version of the `", stringify!($extension), "` extension.")]
                pub $extension: (u32, u32),
            )*
        }

        impl Extensions {
            /// Checks every extension this adapter depends on, erroring out
            /// on the first one the server lacks or reports too old a
            /// version for.
            pub fn check_extensions<C: x11rb::connection::Connection>(connection: &C) -> Result<Extensions, SetupError> {
                $(
                    let $extension = {
                        use x11rb::protocol::$extension::{ConnectionExt as _, X11_EXTENSION_NAME};

                        if connection
                            .extension_information(X11_EXTENSION_NAME)
                            .map_err(|err| SetupError::Protocol(err.to_string()))?
                            .is_some()
                        {
                            let version = connection
                                .$extension_fn($req_major, $req_minor)
                                .map_err(|err| SetupError::Protocol(err.to_string()))?
                                .reply()
                                .map_err(|err| SetupError::Protocol(err.to_string()))?;

                            #[allow(unused_comparisons)]
                            if version.major_version > $min_major
                                || (version.major_version == $min_major && version.minor_version >= $min_minor)
                            {
                                tracing::debug!(
                                    extension = X11_EXTENSION_NAME,
                                    major = version.major_version,
                                    minor = version.minor_version,
                                    "negotiated extension version",
                                );

                                (version.major_version, version.minor_version)
                            } else {
                                tracing::warn!(
                                    extension = X11_EXTENSION_NAME,
                                    have_major = version.major_version,
                                    have_minor = version.minor_version,
                                    need_major = $min_major,
                                    need_minor = $min_minor,
                                    "extension version too low",
                                );

                                return Err(SetupError::ExtensionTooOld {
                                    name: X11_EXTENSION_NAME,
                                    required_major: $min_major,
                                    required_minor: $min_minor,
                                    available_major: version.major_version,
                                    available_minor: version.minor_version,
                                });
                            }
                        } else {
                            tracing::warn!(extension = X11_EXTENSION_NAME, "extension not present");

                            return Err(SetupError::ExtensionNotFound {
                                name: X11_EXTENSION_NAME,
                                major: $min_major,
                                minor: $min_minor,
                            });
                        }
                    };
                )*

                Ok(Extensions {
                    $(
                        $extension,
                    )*
                })
            }
        }
    };
}

extensions! {
    dri3 {
        dri3_query_version,
        minimum: (1, 2),
        request: (1, 4),
    },

    present {
        present_query_version,
        minimum: (1, 2),
        request: (1, 4),
    },
}

impl Extensions {
    /// Whether the negotiated DRI3 version supports `ImportSyncobj` /
    /// `FreeSyncobj`, required for explicit fence synchronization.
    pub fn supports_syncobj(&self) -> bool {
        self.dri3 >= (1, 4)
    }

    /// Whether the negotiated Present version supports `PixmapSynced`.
    pub fn supports_pixmap_synced(&self) -> bool {
        self.present >= (1, 4)
    }

    /// Whether the negotiated DRI3 version supports `PixmapFromBuffers`
    /// (multi-plane, modifier-aware); older servers only ever grant
    /// `PixmapFromBuffer` and buffers must be single-plane.
    pub fn supports_multiplane(&self) -> bool {
        self.dri3 >= (1, 2)
    }
}
