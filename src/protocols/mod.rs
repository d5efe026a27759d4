//! Protocol bindings not covered by the wayland-protocols crates.
//!
//! The legacy `wl_drm` buffer-sharing extension predates linux-dmabuf and is
//! still advertised by most compositors; bindings are generated here with
//! wayland-scanner from the vendored protocol XML.

/// wl_drm (mesa's legacy DRM buffer-sharing protocol)
pub mod wl_drm {
    pub mod server {
        use wayland_server;

        pub mod __interfaces {
            use wayland_server::protocol::__interfaces::*;
            wayland_scanner::generate_interfaces!("./protocols/wayland-drm.xml");
        }
        use self::__interfaces::*;
        use wayland_server::protocol::*;

        wayland_scanner::generate_server_code!("./protocols/wayland-drm.xml");
    }

    pub mod client {
        use wayland_client;

        pub mod __interfaces {
            use wayland_client::protocol::__interfaces::*;
            wayland_scanner::generate_interfaces!("./protocols/wayland-drm.xml");
        }
        use self::__interfaces::*;
        use wayland_client::protocol::*;

        wayland_scanner::generate_client_code!("./protocols/wayland-drm.xml");
    }
}
