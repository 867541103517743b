//! Engine version handling.
//!
//! Factorio truncates trailing zero components ("1.1" means "1.1.0"),
//! so versions are normalized before comparison. A mod is compatible
//! with an instance when the major and minor components agree.

/// Normalize a version string: strip a leading `v` and right-pad a
/// two-component version with `.0`.
pub fn normalize(version: &str) -> String {
    let version = version.strip_prefix('v').unwrap_or(version);
    let parts = version.split('.').count();
    if parts == 2 {
        format!("{version}.0")
    } else {
        version.to_string()
    }
}

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let normalized = normalize(version);
    let mut parts = normalized.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Whether a mod declaring `declared` runs on an engine of version
/// `engine`. Unparseable versions are never compatible.
pub fn is_compatible(engine: &str, declared: &str) -> bool {
    match (major_minor(engine), major_minor(declared)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_two_component_versions() {
        assert_eq!(normalize("1.1"), "1.1.0");
        assert_eq!(normalize("1.1.87"), "1.1.87");
        assert_eq!(normalize("v2.0"), "2.0.0");
    }

    #[test]
    fn same_major_minor_is_compatible() {
        assert!(is_compatible("1.1", "1.1.87"));
        assert!(is_compatible("1.1.110", "1.1"));
        assert!(is_compatible("2.0.15", "2.0"));
    }

    #[test]
    fn different_minor_is_incompatible() {
        assert!(!is_compatible("1.1", "1.0"));
        assert!(!is_compatible("2.0", "1.1.87"));
    }

    #[test]
    fn garbage_is_incompatible() {
        assert!(!is_compatible("1.1", "not-a-version"));
        assert!(!is_compatible("", "1.1"));
    }
}
