//! Executable discovery for supervised binaries.
//!
//! Probe order, first match wins:
//! 1. explicit override path (when configured)
//! 2. `<native_lib_dir>/<abi>/<name>` for the running device
//! 3. the same path under each sibling ABI
//! 4. `<data_dir>/bin/<name>`, a previously extracted copy
//! 5. extraction from `<assets_dir>/<name>` (only when the caller allows it)
//! 6. a `PATH` lookup, for desktop hosts with a system-wide install

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Where binaries may live on this host.
#[derive(Debug, Clone, Default)]
pub struct InstallLayout {
    /// Root holding one directory per ABI (e.g. `lib/arm64-v8a`).
    pub native_lib_dir: Option<PathBuf>,
    /// ABI of the running device.
    pub abi: String,
    /// Other ABIs to probe if the primary one has no copy.
    pub sibling_abis: Vec<String>,
    /// App-private storage; extracted binaries go in `bin/` below it.
    pub data_dir: PathBuf,
    /// Directory holding bundled binaries that can be extracted.
    pub assets_dir: Option<PathBuf>,
}

/// Resolves binary names to paths using an [`InstallLayout`].
#[derive(Debug, Clone)]
pub struct ExecutableLocator {
    layout: InstallLayout,
}

impl ExecutableLocator {
    pub fn new(layout: InstallLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// Directory extracted binaries are written to.
    pub fn extracted_dir(&self) -> PathBuf {
        self.layout.data_dir.join("bin")
    }

    /// Find `name`, probing every location in order.
    ///
    /// Asset extraction is only attempted when `allow_extraction` is set; it is
    /// reserved for the daemon binary.
    pub fn locate(
        &self,
        name: &str,
        override_path: Option<&Path>,
        allow_extraction: bool,
    ) -> Option<PathBuf> {
        if let Some(path) = override_path {
            if is_executable_file(path) {
                return Some(path.to_path_buf());
            }
            warn!("Configured path {} is not an executable file", path.display());
        }

        for candidate in self.install_candidates(name) {
            if is_executable_file(&candidate) {
                debug!("Found {} at {}", name, candidate.display());
                return Some(candidate);
            }
        }

        if allow_extraction {
            match self.extract_asset(name) {
                Ok(Some(path)) => return Some(path),
                Ok(None) => {}
                Err(e) => warn!("Failed to extract bundled {}: {}", name, e),
            }
        }

        which::which(name).ok()
    }

    /// Whether `name` can be found without extracting anything.
    pub fn is_available(&self, name: &str, override_path: Option<&Path>) -> bool {
        self.locate(name, override_path, false).is_some()
    }

    /// Install-directory candidates in probe order (steps 2-4).
    pub fn install_candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(ref root) = self.layout.native_lib_dir {
            candidates.push(root.join(&self.layout.abi).join(name));
            for abi in &self.layout.sibling_abis {
                if *abi != self.layout.abi {
                    candidates.push(root.join(abi).join(name));
                }
            }
        }
        candidates.push(self.extracted_dir().join(name));
        candidates
    }

    fn extract_asset(&self, name: &str) -> std::io::Result<Option<PathBuf>> {
        let Some(ref assets) = self.layout.assets_dir else {
            return Ok(None);
        };
        let source = assets.join(name);
        if !source.is_file() {
            return Ok(None);
        }

        let target_dir = self.extracted_dir();
        fs::create_dir_all(&target_dir)?;
        let target = target_dir.join(name);
        fs::copy(&source, &target)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o700))?;
        }

        info!("Extracted bundled {} to {}", name, target.display());
        Ok(Some(target))
    }
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn touch_exec(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn layout(root: &Path) -> InstallLayout {
        InstallLayout {
            native_lib_dir: Some(root.join("lib")),
            abi: "arm64-v8a".to_string(),
            sibling_abis: vec!["armeabi-v7a".to_string(), "x86_64".to_string()],
            data_dir: root.join("data"),
            assets_dir: Some(root.join("assets")),
        }
    }

    #[test]
    fn test_primary_abi_wins_over_sibling() {
        let dir = tempfile::tempdir().unwrap();
        touch_exec(&dir.path().join("lib/arm64-v8a/libdaemon_test.so"));
        touch_exec(&dir.path().join("lib/x86_64/libdaemon_test.so"));

        let locator = ExecutableLocator::new(layout(dir.path()));
        let found = locator.locate("libdaemon_test.so", None, false).unwrap();
        assert!(found.ends_with("lib/arm64-v8a/libdaemon_test.so"));
    }

    #[test]
    fn test_sibling_abi_fallback() {
        let dir = tempfile::tempdir().unwrap();
        touch_exec(&dir.path().join("lib/x86_64/libdaemon_test.so"));

        let locator = ExecutableLocator::new(layout(dir.path()));
        let found = locator.locate("libdaemon_test.so", None, false).unwrap();
        assert!(found.ends_with("lib/x86_64/libdaemon_test.so"));
    }

    #[test]
    fn test_extracted_copy_before_asset() {
        let dir = tempfile::tempdir().unwrap();
        touch_exec(&dir.path().join("data/bin/libdaemon_test.so"));
        touch_exec(&dir.path().join("assets/libdaemon_test.so"));

        let locator = ExecutableLocator::new(layout(dir.path()));
        let found = locator.locate("libdaemon_test.so", None, true).unwrap();
        assert_eq!(found, dir.path().join("data/bin/libdaemon_test.so"));
    }

    #[test]
    fn test_asset_extraction_only_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        touch_exec(&dir.path().join("assets/libdaemon_test.so"));
        let locator = ExecutableLocator::new(layout(dir.path()));

        assert!(!locator.is_available("libdaemon_test.so", None));

        let found = locator.locate("libdaemon_test.so", None, true).unwrap();
        assert_eq!(found, dir.path().join("data/bin/libdaemon_test.so"));
        let mode = fs::metadata(&found).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_override_path_first() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("custom/daemon");
        touch_exec(&custom);
        touch_exec(&dir.path().join("lib/arm64-v8a/daemon"));

        let locator = ExecutableLocator::new(layout(dir.path()));
        assert_eq!(locator.locate("daemon", Some(&custom), false), Some(custom));
    }

    #[test]
    fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ExecutableLocator::new(layout(dir.path()));
        assert!(locator
            .locate("veilnet-definitely-missing-helper", None, true)
            .is_none());
    }
}
