// Startup configuration
//
// Everything is read from the environment once in `Cyclone::spin`.
//
// Austin Shafer - 2024
use squall::Requirements;
use utils::env_flag;

/// How we are going to put pixels on screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Take over the DRM devices of our seat through logind
    Drm,
    /// Run inside another compositor. The embedder hands us surfaces.
    Nested { display: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    /// Prefer integrated GPUs over discrete ones
    pub prefer_integrated: bool,
    /// Ask for HDR/wide gamut surface formats
    pub wide_color: bool,
    /// Load the Khronos validation layer
    pub validation: bool,
    /// Use this logind session instead of looking one up
    pub session_id: Option<String>,
    /// Stop the main loop after this many iterations
    pub frame_limit: Option<u64>,
    /// Socket name to advertise in WAYLAND_DISPLAY
    pub socket_name: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| lookup(name).map(|v| env_flag(&v)).unwrap_or(false);
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend = match non_empty("WAYLAND_DISPLAY") {
            Some(display) => Backend::Nested { display: display },
            None => Backend::Drm,
        };

        let frame_limit = match non_empty("CYCLONE_FRAMES") {
            Some(v) => match v.trim().parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    utils::log::error!("Ignoring invalid CYCLONE_FRAMES value {:?}", v);
                    None
                }
            },
            None => None,
        };

        Self {
            backend: backend,
            prefer_integrated: flag("CYCLONE_PREFER_INTEGRATED"),
            wide_color: flag("CYCLONE_WIDE_COLOR"),
            validation: flag("CYCLONE_VALIDATION"),
            session_id: non_empty("XDG_SESSION_ID"),
            frame_limit: frame_limit,
            socket_name: non_empty("CYCLONE_SOCKET"),
        }
    }

    /// The device requirements implied by this config
    pub fn requirements(&self) -> Requirements {
        let mut reqs = Requirements::GRAPHICS;
        if self.prefer_integrated {
            reqs |= Requirements::PREFER_INTEGRATED;
        }
        if self.wide_color {
            reqs |= Requirements::WIDE_COLOR;
        }
        reqs
    }
}

/// Tell clients where to find us
pub fn advertise_display(name: &str) {
    std::env::set_var("WAYLAND_DISPLAY", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_to_drm() {
        let cfg = config(&[]);
        assert_eq!(cfg.backend, Backend::Drm);
        assert!(!cfg.prefer_integrated);
        assert!(!cfg.wide_color);
        assert!(cfg.session_id.is_none());
        assert!(cfg.frame_limit.is_none());
    }

    #[test]
    fn wayland_display_means_nested() {
        let cfg = config(&[("WAYLAND_DISPLAY", "wayland-0")]);
        assert_eq!(
            cfg.backend,
            Backend::Nested {
                display: "wayland-0".to_string()
            }
        );

        let cfg = config(&[("WAYLAND_DISPLAY", "")]);
        assert_eq!(cfg.backend, Backend::Drm);
    }

    #[test]
    fn flags_and_limits() {
        let cfg = config(&[
            ("CYCLONE_PREFER_INTEGRATED", "yes"),
            ("CYCLONE_WIDE_COLOR", "0"),
            ("XDG_SESSION_ID", "c2"),
            ("CYCLONE_FRAMES", "120"),
        ]);
        assert!(cfg.prefer_integrated);
        assert!(!cfg.wide_color);
        assert_eq!(cfg.session_id.as_deref(), Some("c2"));
        assert_eq!(cfg.frame_limit, Some(120));

        let reqs = cfg.requirements();
        assert!(reqs.contains(Requirements::PREFER_INTEGRATED));
        assert!(!reqs.contains(Requirements::WIDE_COLOR));

        let cfg = config(&[("CYCLONE_FRAMES", "lots")]);
        assert!(cfg.frame_limit.is_none());
    }
}
