//! Host toolchain lookup
//!
//! Resolves the Android SDK and NDK roots and the host-side binaries the
//! debugger needs: `adb`, the device `lldb-server`, `simpleperf` (device and
//! host builds) and `aapt2`.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use adbg_core::prelude::*;

/// Resolved SDK/NDK locations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toolchain {
    pub sdk_root: Option<PathBuf>,
    pub ndk_root: Option<PathBuf>,

    /// Flat `<root>/<abi>/lldb-server` layout, searched before the NDK
    pub lldb_server_root: Option<PathBuf>,
}

impl Toolchain {
    /// Resolve roots from configured values, falling back to the environment
    /// and the usual install locations.
    pub fn resolve(
        sdk_root: Option<&Path>,
        ndk_root: Option<&Path>,
        lldb_server_root: Option<&Path>,
    ) -> Self {
        let sdk_root = find_sdk_root(sdk_root);
        let ndk_root = find_ndk_root(sdk_root.as_deref(), ndk_root);

        match &sdk_root {
            Some(p) => debug!("Using SDK root {}", p.display()),
            None => warn!("Cannot determine Android SDK root"),
        }
        match &ndk_root {
            Some(p) => debug!("Using NDK root {}", p.display()),
            None => warn!("Cannot determine Android NDK root"),
        }

        Self {
            sdk_root,
            ndk_root,
            lldb_server_root: lldb_server_root.map(Path::to_path_buf),
        }
    }

    pub fn require_sdk_root(&self) -> Result<&Path> {
        self.sdk_root
            .as_deref()
            .ok_or_else(|| Error::tool_not_found("Android SDK (set paths.sdk_root or ANDROID_HOME)"))
    }

    pub fn require_ndk_root(&self) -> Result<&Path> {
        self.ndk_root
            .as_deref()
            .ok_or_else(|| Error::tool_not_found("Android NDK (set paths.ndk_root or ANDROID_NDK_ROOT)"))
    }

    /// Every path that may hold `lldb-server` for `abi`, in search order.
    pub fn lldb_server_candidates(&self, abi: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(root) = &self.lldb_server_root {
            candidates.push(root.join(abi).join("lldb-server"));
        }

        let (Some(ndk), Some(arch)) = (&self.ndk_root, abi_arch(abi)) else {
            return candidates;
        };

        let prebuilt = ndk
            .join("toolchains")
            .join("llvm")
            .join("prebuilt")
            .join(host_tag());

        // r23+ ships lib64/clang, later releases moved to lib/clang.
        for lib in ["lib64", "lib"] {
            let clang = prebuilt.join(lib).join("clang");
            for version in version_dirs_newest_first(&clang) {
                candidates.push(
                    clang
                        .join(version)
                        .join("lib")
                        .join("linux")
                        .join(arch)
                        .join("lldb-server"),
                );
            }
        }

        candidates
    }

    /// First existing `lldb-server` for `abi`.
    pub fn find_lldb_server(&self, abi: &str) -> Result<PathBuf> {
        let searched = self.lldb_server_candidates(abi);
        for path in &searched {
            if path.is_file() {
                debug!("Found lldb-server for {} at {}", abi, path.display());
                return Ok(dunce::simplified(path).to_path_buf());
            }
            trace!("No lldb-server at {}", path.display());
        }
        Err(Error::ServerBinaryNotFound {
            abi: abi.to_string(),
            searched,
        })
    }

    /// Device build of simpleperf for `abi`.
    pub fn device_simpleperf(&self, abi: &str) -> Result<PathBuf> {
        let ndk = self.require_ndk_root()?;
        let arch = simpleperf_arch(abi)
            .ok_or_else(|| Error::invalid_argument(format!("Unsupported ABI for simpleperf: {}", abi)))?;
        let path = ndk
            .join("simpleperf")
            .join("bin")
            .join("android")
            .join(arch)
            .join("simpleperf");
        existing(path, "simpleperf (device)")
    }

    /// Host build of simpleperf used for `report-sample` conversion.
    pub fn host_simpleperf(&self) -> Result<PathBuf> {
        let ndk = self.require_ndk_root()?;
        let path = ndk
            .join("simpleperf")
            .join("bin")
            .join(host_os())
            .join("x86_64")
            .join(exe("simpleperf"));
        existing(path, "simpleperf (host)")
    }

    /// `aapt2` from the newest installed build-tools.
    pub fn aapt2(&self) -> Result<PathBuf> {
        let sdk = self.require_sdk_root()?;
        let build_tools = sdk.join("build-tools");
        version_dirs_newest_first(&build_tools)
            .into_iter()
            .map(|v| build_tools.join(v).join(exe("aapt2")))
            .find(|p| p.is_file())
            .ok_or_else(|| Error::tool_not_found("aapt2 (install Android SDK build-tools)"))
    }
}

fn existing(path: PathBuf, name: &str) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::tool_not_found(format!("{} at {}", name, path.display())))
    }
}

/// Path of `adb` inside an SDK root.
pub fn adb_in_sdk(sdk_root: &Path) -> PathBuf {
    sdk_root.join("platform-tools").join(exe("adb"))
}

/// NDK `lib/linux/<arch>` directory name for an ABI.
pub fn abi_arch(abi: &str) -> Option<&'static str> {
    match abi {
        "arm64-v8a" => Some("aarch64"),
        "armeabi-v7a" | "armeabi" => Some("arm"),
        "x86" => Some("i386"),
        "x86_64" => Some("x86_64"),
        _ => None,
    }
}

/// simpleperf's `bin/android/<arch>` directory name for an ABI.
fn simpleperf_arch(abi: &str) -> Option<&'static str> {
    match abi {
        "arm64-v8a" => Some("arm64"),
        "armeabi-v7a" | "armeabi" => Some("arm"),
        "x86" => Some("x86"),
        "x86_64" => Some("x86_64"),
        _ => None,
    }
}

/// NDK prebuilt host tag, e.g. `linux-x86_64`.
pub fn host_tag() -> String {
    format!("{}-x86_64", host_os())
}

fn host_os() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    }
}

fn exe(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────
// Root discovery
// ─────────────────────────────────────────────────────────────────

fn is_valid_sdk_root(path: &Path) -> bool {
    path.is_dir() && adb_in_sdk(path).is_file()
}

fn is_valid_ndk_root(path: &Path) -> bool {
    path.is_dir() && path.join("toolchains").join("llvm").is_dir()
}

fn common_sdk_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if cfg!(target_os = "windows") {
        if let Some(local) = dirs::data_local_dir() {
            roots.push(local.join("Android").join("sdk"));
        }
    } else if let Some(home) = dirs::home_dir() {
        if cfg!(target_os = "macos") {
            roots.push(home.join("Library").join("Android").join("sdk"));
        } else {
            roots.push(home.join("Android").join("Sdk"));
            roots.push(home.join("Android").join("sdk"));
        }
    }
    roots
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Configured root, then `ANDROID_HOME`/`ANDROID_SDK_ROOT`, then the
/// platform default install location.
pub fn find_sdk_root(custom: Option<&Path>) -> Option<PathBuf> {
    if let Some(custom) = custom {
        if is_valid_sdk_root(custom) {
            return Some(custom.to_path_buf());
        }
        warn!("Configured SDK root {} is not valid, trying other options", custom.display());
    }

    ["ANDROID_HOME", "ANDROID_SDK_ROOT"]
        .into_iter()
        .filter_map(env_path)
        .chain(common_sdk_roots())
        .find(|p| is_valid_sdk_root(p))
}

/// Configured root, then `ANDROID_NDK_ROOT`, then `<sdk>/ndk/<version>` and
/// `<sdk>/ndk-bundle`.
pub fn find_ndk_root(sdk_root: Option<&Path>, custom: Option<&Path>) -> Option<PathBuf> {
    if let Some(custom) = custom {
        if is_valid_ndk_root(custom) {
            return Some(custom.to_path_buf());
        }
        warn!("Configured NDK root {} is not valid, trying other options", custom.display());
    }

    if let Some(env) = env_path("ANDROID_NDK_ROOT").filter(|p| is_valid_ndk_root(p)) {
        return Some(env);
    }

    let sdk = sdk_root?;
    for dir in ["ndk", "ndk-bundle"] {
        let root = sdk.join(dir);
        if is_valid_ndk_root(&root) {
            return Some(root);
        }
        if let Some(found) = version_dirs_newest_first(&root)
            .into_iter()
            .map(|v| root.join(v))
            .find(|p| is_valid_ndk_root(p))
        {
            return Some(found);
        }
    }
    None
}

// ─────────────────────────────────────────────────────────────────
// Version directories
// ─────────────────────────────────────────────────────────────────

/// Names of subdirectories of `dir`, highest version first.
fn version_dirs_newest_first(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();

    names.sort_by(|a, b| compare_versions(b, a));
    names
}

/// Compare dotted version strings numerically, non-numeric parts last.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<Option<u64>> { s.split(['.', '-']).map(|p| p.parse().ok()).collect() };
    let (pa, pb) = (parse(a), parse(b));

    for (x, y) in pa.iter().zip(pb.iter()) {
        let ord = match (x, y) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    pa.len().cmp(&pb.len()).then_with(|| a.cmp(b))
}
