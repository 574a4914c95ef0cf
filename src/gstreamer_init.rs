//! GStreamer setup for network capture and the GStreamer clip encoder
//!
//! A private GStreamer tree can sit next to the executable (`gstreamer/`)
//! or be named by `VIGIL_GSTREAMER_DIR`. When found, its binaries and
//! plugins take precedence over the system installation.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Once;

static GSTREAMER_INIT: Once = Once::new();

/// Environment variable naming a private GStreamer tree
pub const PRIVATE_DIR_VAR: &str = "VIGIL_GSTREAMER_DIR";

/// Initialize GStreamer once per process
///
/// Safe to call from every capture or encoder constructor; only the first
/// call does any work. Failure is logged, and later pipeline construction
/// reports the concrete error.
pub fn init_gstreamer_env() {
    GSTREAMER_INIT.call_once(|| {
        if let Some(dir) = private_deployment_dir() {
            use_private_deployment(&dir);
        }

        match gstreamer::init() {
            Ok(_) => log::info!("[GStreamer] Initialized, version {}", version_string()),
            Err(e) => {
                log::error!("[GStreamer] Failed to initialize: {}", e);
                log::error!("[GStreamer] Network sources and the gstreamer clip encoder are unavailable");
            }
        }
    });
}

/// Private tree from the environment, else `gstreamer/` beside the executable
fn private_deployment_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os(PRIVATE_DIR_VAR).map(PathBuf::from) {
        if dir.is_dir() {
            return Some(dir);
        }
        log::warn!("[GStreamer] {} points at missing {}", PRIVATE_DIR_VAR, dir.display());
    }

    let exe = env::current_exe().ok()?;
    let dir = exe.parent()?.join("gstreamer");
    dir.is_dir().then_some(dir)
}

/// (bin, plugins) inside a private tree, if it has the expected layout
fn deployment_layout(root: &Path) -> Option<(PathBuf, PathBuf)> {
    let bin = root.join("bin");
    let plugins = root.join("lib").join("gstreamer-1.0");
    bin.is_dir().then_some((bin, plugins))
}

fn use_private_deployment(root: &Path) {
    let Some((bin_dir, plugin_dir)) = deployment_layout(root) else {
        log::warn!("[GStreamer] No bin/ under {}; using system GStreamer", root.display());
        return;
    };
    log::info!("[GStreamer] Using private deployment at {}", root.display());

    let mut paths = vec![bin_dir.clone()];
    if let Some(existing) = env::var_os("PATH") {
        paths.extend(env::split_paths(&existing));
    }
    match env::join_paths(paths) {
        Ok(joined) => env::set_var("PATH", joined),
        Err(e) => log::warn!("[GStreamer] Could not extend PATH: {}", e),
    }

    if plugin_dir.is_dir() {
        env::set_var("GST_PLUGIN_PATH", &plugin_dir);
        log::debug!("[GStreamer] GST_PLUGIN_PATH={}", plugin_dir.display());
    }

    let scanner_name = if cfg!(windows) {
        "gst-plugin-scanner.exe"
    } else {
        "gst-plugin-scanner"
    };
    let scanner = bin_dir.join(scanner_name);
    if scanner.exists() {
        env::set_var("GST_PLUGIN_SCANNER", &scanner);
    }

    // Keep the private plugin registry apart from the system one
    if let Some(cache) = dirs::cache_dir() {
        let registry = cache.join("vigil").join("gst-registry.bin");
        if let Some(parent) = registry.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("[GStreamer] Could not create {}: {}", parent.display(), e);
            }
        }
        env::set_var("GST_REGISTRY", &registry);
    }
}

/// "major.minor.micro" plus a prerelease marker
pub fn version_string() -> String {
    let (major, minor, micro, nano) = gstreamer::version();
    match nano {
        0 => format!("{}.{}.{}", major, minor, micro),
        1 => format!("{}.{}.{} (git)", major, minor, micro),
        _ => format!("{}.{}.{} (prerelease)", major, minor, micro),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_requires_a_bin_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(deployment_layout(dir.path()).is_none());

        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        let (bin, plugins) = deployment_layout(dir.path()).unwrap();
        assert_eq!(bin, dir.path().join("bin"));
        assert_eq!(plugins, dir.path().join("lib").join("gstreamer-1.0"));
    }
}
