use semver::Version;
use std::cmp::Ordering;

/// Compare two plugin versions.
///
/// Versions that look like semver (optionally with missing minor/patch parts)
/// are compared as such, anything else falls back to comparing numeric and
/// textual segments one by one.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_semver(a), parse_semver(b)) {
        (Some(a), Some(b)) => a.cmp_precedence(&b),
        _ => compare_segments(a, b),
    }
}

pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

fn parse_semver(version: &str) -> Option<Version> {
    let version = version.trim().trim_start_matches('v');
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }

    let suffix_idx = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = version.split_at(suffix_idx);

    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = parts.next().map(|part| part.parse::<u64>().ok());
    let patch = parts.next().map(|part| part.parse::<u64>().ok());

    if parts.next().is_some() {
        return None;
    }

    let normalized = match (minor, patch) {
        (None, None) => format!("{}.0.0{}", major, suffix),
        (Some(Some(minor)), None) => format!("{}.{}.0{}", major, minor, suffix),
        (Some(Some(minor)), Some(Some(patch))) => format!("{}.{}.{}{}", major, minor, patch, suffix),
        _ => return None,
    };

    Version::parse(&normalized).ok()
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Number(u64),
    Word(&'a str),
}

fn segments(version: &str) -> Vec<Segment<'_>> {
    let mut result = Vec::new();
    let mut start = None::<(usize, bool)>;

    for (idx, c) in version.char_indices().chain(std::iter::once((version.len(), '.'))) {
        let kind = if c.is_ascii_digit() {
            Some(true)
        } else if c.is_alphabetic() {
            Some(false)
        } else {
            None
        };

        match (start, kind) {
            (Some((_, numeric)), Some(k)) if numeric == k => continue,
            (Some((from, numeric)), _) => {
                let token = &version[from..idx];
                result.push(if numeric {
                    Segment::Number(token.parse().unwrap_or(u64::MAX))
                } else {
                    Segment::Word(token)
                });
                start = kind.map(|k| (idx, k));
            }
            (None, _) => start = kind.map(|k| (idx, k)),
        }
    }

    result
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let a = segments(a);
    let b = segments(b);

    for idx in 0..a.len().max(b.len()) {
        let ordering = match (a.get(idx), b.get(idx)) {
            (Some(Segment::Number(x)), Some(Segment::Number(y))) => x.cmp(y),
            (Some(Segment::Word(x)), Some(Segment::Word(y))) => {
                x.to_ascii_lowercase().cmp(&y.to_ascii_lowercase())
            }
            // Numbers rank above qualifiers such as "eap" or "beta".
            (Some(Segment::Number(_)), Some(Segment::Word(_))) => Ordering::Greater,
            (Some(Segment::Word(_)), Some(Segment::Number(_))) => Ordering::Less,
            // A trailing qualifier marks a pre-release, a trailing number a newer build.
            (Some(Segment::Word(_)), None) => Ordering::Less,
            (None, Some(Segment::Word(_))) => Ordering::Greater,
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_like_versions() {
        assert!(is_newer_version("1.0.1", "1.0.0"));
        assert!(is_newer_version("2", "1.9.9"));
        assert!(is_newer_version("1.2", "1.1.9"));
        assert!(is_newer_version("1.0.0", "1.0.0-beta.2"));
        assert!(!is_newer_version("1.2", "1.2.0"));
        assert!(!is_newer_version("1.0.0", "1.0.1"));
    }

    #[test]
    fn ide_style_versions() {
        assert!(is_newer_version("241.14494.240", "241.14494.17"));
        assert!(is_newer_version("0.4.200.5420-241", "0.4.199.5409-241"));
        assert!(is_newer_version("2024.1.1", "2024.1-eap"));
        assert!(!is_newer_version("1.0-eap", "1.0"));
        assert_eq!(compare_versions("1.0.0.1", "1.0.0.1"), Ordering::Equal);
    }

    #[test]
    fn segments_split_digits_and_words() {
        assert_eq!(
            segments("1.2beta3"),
            vec![
                Segment::Number(1),
                Segment::Number(2),
                Segment::Word("beta"),
                Segment::Number(3)
            ]
        );
    }
}
