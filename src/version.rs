//! Build/version metadata (mirrors `nvc_version()`/`nvc_entrypoint`).
//!
//! Grounded on `original_source/src/nvc.c`'s static `nvc_version` struct
//! and `nvc_entrypoint`'s version/build banner, using `shadow-rs` instead
//! of hand-rolled `build.rs` `env!()` plumbing.

shadow_rs::shadow!(build_info);

/// One line identifying this build, analogous to `nvc_entrypoint`'s
/// `version:`/`build revision:`/`build platform:` banner lines.
pub fn banner() -> String {
    format!(
        "{} ({})\nbuild target: {}\nrust: {}",
        build_info::PKG_VERSION,
        if build_info::GIT_CLEAN {
            build_info::SHORT_COMMIT
        } else {
            "unknown"
        },
        build_info::BUILD_TARGET,
        build_info::RUST_VERSION,
    )
}

pub fn pkg_version() -> &'static str {
    build_info::PKG_VERSION
}
