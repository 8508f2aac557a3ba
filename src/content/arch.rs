//! Architecture lists and consumer compatibility.

const X86_FAMILY: &[&str] = &["x86", "i386", "i486", "i586", "i686"];

/// Arches that match every consumer.
const UNIVERSAL: &[&str] = &["noarch", "ALL"];

/// Parse a comma separated arch list, trimming blanks and keeping first-seen order.
pub fn parse_arches(value: Option<&str>) -> Vec<String> {
    let mut arches: Vec<String> = Vec::new();
    for arch in value.unwrap_or_default().split(',').map(str::trim) {
        if !arch.is_empty() && !arches.iter().any(|a| a == arch) {
            arches.push(arch.to_string());
        }
    }
    arches
}

pub fn is_x86(arch: &str) -> bool {
    X86_FAMILY.contains(&arch)
}

/// Whether a single content arch can serve the consumer arch.
pub fn arch_matches(content_arch: &str, consumer_arch: &str) -> bool {
    content_arch == consumer_arch
        || UNIVERSAL.contains(&content_arch)
        || (is_x86(content_arch) && is_x86(consumer_arch))
}

/// A consumer without an arch fact, or content without arches, is always compatible.
pub fn is_compatible(content_arches: &[String], consumer_arch: Option<&str>) -> bool {
    let consumer_arch = match consumer_arch.map(str::trim).filter(|a| !a.is_empty()) {
        Some(arch) => arch,
        None => return true,
    };
    content_arches.is_empty()
        || content_arches
            .iter()
            .any(|arch| arch_matches(arch, consumer_arch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arches_dedups_and_trims() {
        assert_eq!(
            parse_arches(Some(" x86_64, ppc64,,x86_64 ")),
            vec!["x86_64".to_string(), "ppc64".to_string()]
        );
        assert!(parse_arches(None).is_empty());
        assert!(parse_arches(Some(" , ")).is_empty());
    }

    #[test]
    fn test_compatibility_rules() {
        let arches = |v: &str| parse_arches(Some(v));

        assert!(is_compatible(&arches("x86_64"), Some("x86_64")));
        assert!(!is_compatible(&arches("ppc64"), Some("x86_64")));
        assert!(is_compatible(&arches("ppc64,noarch"), Some("s390x")));
        assert!(is_compatible(&arches("ALL"), Some("aarch64")));
        assert!(is_compatible(&arches("i386"), Some("i686")));
        assert!(!is_compatible(&arches("i386"), Some("x86_64")));
        assert!(is_compatible(&[], Some("x86_64")));
        assert!(is_compatible(&arches("ppc64"), None));
        assert!(is_compatible(&arches("ppc64"), Some("  ")));
    }
}
