//! Semantic version triplet used for the kernel driver feature gates.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = String;

    /// Parses `major.minor.patch`. A missing patch component is treated as
    /// zero; anything after a `-` or `+` in the last component is ignored,
    /// matching what the kernel module exposes in sysfs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let core = s
            .split_once(['-', '+'])
            .map(|(head, _)| head)
            .unwrap_or(s);
        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u32, String> {
            match parts.next() {
                None => Ok(0),
                Some(p) => p
                    .parse::<u32>()
                    .map_err(|_| format!("bad {name} component in version string {s:?}")),
            }
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(SemVer::new(major, minor, patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_triplet() {
        let v: SemVer = "1.29.0".parse().unwrap();
        assert_eq!(v, SemVer::new(1, 29, 0));
    }

    #[test]
    fn parses_missing_patch() {
        let v: SemVer = "2.4".parse().unwrap();
        assert_eq!(v, SemVer::new(2, 4, 0));
    }

    #[test]
    fn ignores_prerelease_suffix() {
        let v: SemVer = "2.0.0-rc1".parse().unwrap();
        assert_eq!(v, SemVer::new(2, 0, 0));
    }

    #[test]
    fn ordering_is_semantic() {
        let a: SemVer = "1.34.0".parse().unwrap();
        let b: SemVer = "2.0.0".parse().unwrap();
        let c: SemVer = "2.4.1".parse().unwrap();
        assert!(a < b && b < c);
        assert!(SemVer::new(1, 9, 9) < SemVer::new(1, 34, 0));
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-version".parse::<SemVer>().is_err());
    }
}
