//! Lexicographically sortable versions and upstream watermarks.
//!
//! All persisted orderings in the system (change log keys, CVR patch
//! versions, replication state) are strings whose lexical order reproduces
//! the numeric order of the underlying 64-bit value. This lets SQL
//! `ORDER BY` and range predicates work on version columns without casts,
//! and keeps comparisons on the hot path string-only.
//!
//! The encoding is base-36 with a single leading base-36 digit holding
//! `len(digits) - 1`. A `u64` needs at most 13 base-36 digits so the prefix
//! never exceeds `c`. Examples: `0` → `"00"`, `35` → `"0z"`, `36` → `"110"`.

use std::{
    fmt,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::VersionError;

/// Smallest possible version string, used for freshly created CVRs.
pub const MIN_VERSION: &str = "00";

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encodes a value into its lexi form.
pub fn to_lexi(value: u64) -> String {
    let mut digits = [0u8; 13];
    let mut i = digits.len();
    let mut v = value;
    loop {
        i -= 1;
        digits[i] = BASE36[(v % 36) as usize];
        v /= 36;
        if v == 0 {
            break;
        }
    }
    let len = digits.len() - i;
    let mut out = String::with_capacity(len + 1);
    out.push(BASE36[len - 1] as char);
    out.push_str(std::str::from_utf8(&digits[i..]).expect("ascii digits"));
    out
}

/// Decodes a lexi string back into its numeric value.
pub fn from_lexi(s: &str) -> Result<u64, VersionError> {
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return Err(VersionError::Malformed(s.to_string()));
    }
    let declared = (bytes[0] as char)
        .to_digit(36)
        .ok_or_else(|| VersionError::Malformed(s.to_string()))? as usize;
    if bytes.len() - 1 != declared + 1 {
        return Err(VersionError::Malformed(s.to_string()));
    }
    // Uppercase digits would parse but break lexical ordering.
    if !bytes[1..]
        .iter()
        .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
    {
        return Err(VersionError::Malformed(s.to_string()));
    }
    u64::from_str_radix(&s[1..], 36).map_err(|_| VersionError::Malformed(s.to_string()))
}

/// An upstream Postgres log sequence number.
///
/// Displayed in the familiar `X/Y` hex form; stored and compared as the
/// packed 64-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn from_parts(hi: u32, lo: u32) -> Self {
        Lsn(((hi as u64) << 32) | lo as u64)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| VersionError::MalformedLsn(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| VersionError::MalformedLsn(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| VersionError::MalformedLsn(s.to_string()))?;
        Ok(Lsn::from_parts(hi, lo))
    }
}

/// A lexi-encoded upstream commit LSN.
///
/// This is the `stateVersion` used throughout the CVR and the replica.
/// Equality and ordering operate on the string form; decoding back to an
/// [`Lsn`] only happens at the replication-protocol boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(String);

impl StateVersion {
    pub fn min() -> Self {
        StateVersion(MIN_VERSION.to_string())
    }

    pub fn from_lsn(lsn: Lsn) -> Self {
        StateVersion(to_lexi(lsn.0))
    }

    pub fn to_lsn(&self) -> Result<Lsn, VersionError> {
        from_lexi(&self.0).map(Lsn)
    }

    /// Accepts an already-encoded lexi string, validating it.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        from_lexi(s)?;
        Ok(StateVersion(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A CVR version: the replica state version plus a minor version that is
/// bumped for config-only updates (desired-query changes, client
/// add/remove). An absent minor version compares as zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CvrVersion {
    #[serde(rename = "stateVersion")]
    pub state_version: StateVersion,
    #[serde(rename = "minorVersion", skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<u32>,
}

impl CvrVersion {
    pub fn initial() -> Self {
        CvrVersion { state_version: StateVersion::min(), minor_version: None }
    }

    pub fn of(state_version: StateVersion) -> Self {
        CvrVersion { state_version, minor_version: None }
    }

    /// The next config-only version: same state version, minor + 1.
    pub fn next_minor(&self) -> Self {
        CvrVersion {
            state_version: self.state_version.clone(),
            minor_version: Some(self.minor_version.unwrap_or(0) + 1),
        }
    }

    /// The version for a data update at `state`. Resets the minor version.
    pub fn advanced_to(&self, state: StateVersion) -> Self {
        debug_assert!(state >= self.state_version);
        CvrVersion { state_version: state, minor_version: None }
    }

    /// Renders the cookie string sent to clients: `"<state>"` or
    /// `"<state>:<minor-lexi>"`. The minor part is lexi-encoded so that
    /// cookie strings of the same state version sort correctly too.
    pub fn cookie(&self) -> String {
        match self.minor_version {
            None | Some(0) => self.state_version.as_str().to_string(),
            Some(m) => format!("{}:{}", self.state_version, to_lexi(m as u64)),
        }
    }

    pub fn parse_cookie(cookie: &str) -> Result<Self, VersionError> {
        match cookie.split_once(':') {
            None => Ok(CvrVersion::of(StateVersion::parse(cookie)?)),
            Some((state, minor)) => {
                let minor = from_lexi(minor)?;
                Ok(CvrVersion {
                    state_version: StateVersion::parse(state)?,
                    minor_version: Some(
                        u32::try_from(minor)
                            .map_err(|_| VersionError::Malformed(cookie.to_string()))?,
                    ),
                })
            }
        }
    }
}

impl PartialOrd for CvrVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CvrVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.state_version, self.minor_version.unwrap_or(0))
            .cmp(&(&other.state_version, other.minor_version.unwrap_or(0)))
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cookie())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, "00")]
    #[case(1, "01")]
    #[case(35, "0z")]
    #[case(36, "110")]
    #[case(1295, "1zz")]
    #[case(1296, "2100")]
    #[case(u64::MAX, "c3w5e11264sgsf")]
    fn lexi_encoding(#[case] value: u64, #[case] encoded: &str) {
        assert_eq!(to_lexi(value), encoded);
        assert_eq!(from_lexi(encoded).unwrap(), value);
    }

    #[test]
    fn lexi_order_matches_numeric_order() {
        let samples =
            [0u64, 1, 35, 36, 37, 1295, 1296, 46655, 46656, 1 << 32, u64::MAX - 1, u64::MAX];
        for a in samples {
            for b in samples {
                assert_eq!(to_lexi(a).cmp(&to_lexi(b)), a.cmp(&b), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn rejects_malformed_lexi() {
        for bad in ["", "0", "1z", "0zz", "2あ", "0!"] {
            assert!(from_lexi(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn lsn_roundtrip() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, (0x16u64 << 32) | 0xB374D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(StateVersion::from_lsn(lsn).to_lsn().unwrap(), lsn);
    }

    #[test]
    fn cvr_version_ordering() {
        let v1 = CvrVersion::of(StateVersion::from_lsn(Lsn(100)));
        let v1a = v1.next_minor();
        let v1b = v1a.next_minor();
        let v2 = v1b.advanced_to(StateVersion::from_lsn(Lsn(101)));

        assert!(v1 < v1a);
        assert!(v1a < v1b);
        assert!(v1b < v2);
        assert_eq!(v2.minor_version, None);

        // An absent minor version compares equal to zero.
        let explicit_zero =
            CvrVersion { state_version: v1.state_version.clone(), minor_version: Some(0) };
        assert_eq!(v1.cmp(&explicit_zero), std::cmp::Ordering::Equal);
    }

    #[test]
    fn cookie_roundtrip() {
        let v = CvrVersion { state_version: StateVersion::from_lsn(Lsn(4242)), minor_version: None };
        assert_eq!(CvrVersion::parse_cookie(&v.cookie()).unwrap(), v);

        let v = v.next_minor().next_minor();
        let cookie = v.cookie();
        assert!(cookie.contains(':'));
        assert_eq!(CvrVersion::parse_cookie(&cookie).unwrap(), v);
    }
}
