//! Kernel version information
//!
//! Compile-time version metadata (semantic version, git hash, build
//! timestamp) printed in the boot banner and panic dumps.

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KernelVersionInfo {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub git_hash: [u8; 40],
    pub build_timestamp: u64,
}

/// Returns the kernel version information populated by `build.rs`.
pub fn get_version_info() -> KernelVersionInfo {
    let git_hash_str = env!("GIT_HASH");
    let mut git_hash = [0u8; 40];
    let bytes = git_hash_str.as_bytes();
    let n = bytes.len().min(40);
    git_hash[..n].copy_from_slice(&bytes[..n]);

    KernelVersionInfo {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        git_hash,
        build_timestamp: env!("BUILD_TIMESTAMP").parse().unwrap_or(0),
    }
}
