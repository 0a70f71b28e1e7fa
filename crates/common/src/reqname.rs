//! Naming contract for request archives moving between nodes:
//! `base[.<uuid>].zip`. The uuid segment is ignored for directory naming but
//! carried through for log correlation.

const ARCHIVE_SUFFIX: &str = ".zip";

pub fn is_archive(name: &str) -> bool {
    name.ends_with(ARCHIVE_SUFFIX)
}

/// Archive name without the `.zip` extension, keeping any uuid segment.
pub fn stem(name: &str) -> &str {
    name.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(name)
}

/// The base request name: everything before the first separator.
pub fn base_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// The uuid segment of a `base.uuid.zip` archive name, if present.
pub fn request_uuid(name: &str) -> Option<&str> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() == 3 {
        Some(parts[1])
    } else {
        None
    }
}

/// Outbound artifact name carrying its trace identifier.
pub fn tagged_archive(archname: &str, artifact_id: &str) -> String {
    format!("{archname}.{artifact_id}{ARCHIVE_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_base_and_uuid() {
        assert_eq!(base_name("flood.9a1c.zip"), "flood");
        assert_eq!(base_name("flood.zip"), "flood");
        assert_eq!(request_uuid("flood.9a1c.zip"), Some("9a1c"));
        assert_eq!(request_uuid("flood.zip"), None);
        assert_eq!(stem("flood.9a1c.zip"), "flood.9a1c");
        assert!(is_archive("flood.zip"));
        assert!(!is_archive("flood"));
    }

    #[test]
    fn tags_outbound_artifacts() {
        assert_eq!(tagged_archive("res", "42"), "res.42.zip");
    }
}
