//! Canonical AS-path representation.
//!
//! Stores the same sequence/set segment structure `bgp_rs::ASPath` decodes
//! off the wire (grounded in the teacher's `session/session.rs` prepend
//! logic, which walks `Segment::AS_SEQUENCE`/`Segment::AS_SET`), but as an
//! interned, hashable value so two peers' identical paths collapse to one
//! canonical object (spec.md §4.1).
use std::fmt;

use bgp_rs::{ASPath, Segment};
use serde::{Deserialize, Serialize};

/// One hop in the canonical AS-path: either a single ASN (sequence member)
/// or a set of ASNs contributed by aggregation, still counted as one hop
/// for path-length comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AsPathSegment {
    Sequence(Vec<u32>),
    Set(Vec<u32>),
}

/// Canonical, interned AS-path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AsPathSpec {
    pub segments: Vec<AsPathSegment>,
}

impl AsPathSpec {
    pub fn empty() -> Self {
        Self { segments: Vec::new() }
    }

    /// Segment-length cap past which a prepend opens a new AS_SEQUENCE
    /// rather than growing the current one (spec.md §4.1).
    const MAX_SEQUENCE_LEN: usize = 255;

    /// Prepend `asn` to the leading AS_SEQUENCE, creating one if the path
    /// is empty, starts with an AS_SET, or the leading AS_SEQUENCE is
    /// already at the 255-ASN cap (spec.md §4.1 `AsPathSpec::add`) —
    /// mirrors the teacher's `session.rs` outbound prepend
    /// (`Segment::AS_SEQUENCE(seq) => { seq insert at 0 }`).
    pub fn prepend(&self, asn: u32) -> Self {
        let mut segments = self.segments.clone();
        match segments.first_mut() {
            Some(AsPathSegment::Sequence(seq)) if seq.len() < Self::MAX_SEQUENCE_LEN => {
                seq.insert(0, asn)
            }
            _ => segments.insert(0, AsPathSegment::Sequence(vec![asn])),
        }
        Self { segments }
    }

    /// Total hop count: each AS_SEQUENCE entry is one hop, each AS_SET
    /// segment (regardless of member count) is one hop (Open Question 1).
    pub fn path_length(&self) -> usize {
        self.segments
            .iter()
            .map(|seg| match seg {
                AsPathSegment::Sequence(seq) => seq.len(),
                AsPathSegment::Set(_) => 1,
            })
            .sum()
    }

    /// The left-most (nearest-neighbor) ASN, used for loop detection, the
    /// `neighbor-as` match, and gating MED comparison in `PathCompare`
    /// step 6 (spec.md §4.2).
    pub fn as_left_most_match(&self, asn: u32) -> bool {
        match self.segments.first() {
            Some(AsPathSegment::Sequence(seq)) => seq.first() == Some(&asn),
            Some(AsPathSegment::Set(set)) => set.contains(&asn),
            None => false,
        }
    }

    /// The left-most ASN itself, if any.
    pub fn leftmost_asn(&self) -> Option<u32> {
        match self.segments.first() {
            Some(AsPathSegment::Sequence(seq)) => seq.first().copied(),
            Some(AsPathSegment::Set(set)) => set.first().copied(),
            None => None,
        }
    }

    /// Count of occurrences of `asn` anywhere in the path.
    pub fn all_matches(&self, asn: u32) -> usize {
        self.segments
            .iter()
            .map(|seg| match seg {
                AsPathSegment::Sequence(seq) => seq.iter().filter(|&&a| a == asn).count(),
                AsPathSegment::Set(set) => set.iter().filter(|&&a| a == asn).count(),
            })
            .sum()
    }

    /// True if `asn` appears more than `max_allowed` times (default loop
    /// detection threshold is 1: any repeat is a loop).
    pub fn as_path_loop(&self, asn: u32, max_allowed: usize) -> bool {
        self.all_matches(asn) > max_allowed
    }

    pub fn origin_asn(&self) -> Option<u32> {
        match self.segments.last() {
            Some(AsPathSegment::Sequence(seq)) => seq.last().copied(),
            Some(AsPathSegment::Set(set)) => set.first().copied(),
            None => None,
        }
    }
}

impl From<&ASPath> for AsPathSpec {
    fn from(path: &ASPath) -> Self {
        let segments = path
            .segments
            .iter()
            .map(|seg| match seg {
                Segment::AS_SEQUENCE(asns) => AsPathSegment::Sequence(asns.clone()),
                Segment::AS_SET(asns) => AsPathSegment::Set(asns.clone()),
            })
            .collect();
        Self { segments }
    }
}

impl From<&AsPathSpec> for ASPath {
    fn from(spec: &AsPathSpec) -> Self {
        let segments = spec
            .segments
            .iter()
            .map(|seg| match seg {
                AsPathSegment::Sequence(asns) => Segment::AS_SEQUENCE(asns.clone()),
                AsPathSegment::Set(asns) => Segment::AS_SET(asns.clone()),
            })
            .collect();
        ASPath { segments }
    }
}

impl fmt::Display for AsPathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .segments
            .iter()
            .map(|seg| match seg {
                AsPathSegment::Sequence(asns) => {
                    asns.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ")
                }
                AsPathSegment::Set(asns) => format!(
                    "{{{}}}",
                    asns.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(",")
                ),
            })
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_creates_sequence() {
        let path = AsPathSpec::empty().prepend(65001).prepend(65000);
        assert_eq!(path.to_string(), "65000 65001");
    }

    #[test]
    fn test_path_length_counts_set_as_one_hop() {
        let path = AsPathSpec {
            segments: vec![
                AsPathSegment::Sequence(vec![65000, 65001]),
                AsPathSegment::Set(vec![65002, 65003, 65004]),
            ],
        };
        assert_eq!(path.path_length(), 3);
    }

    #[test]
    fn test_as_path_loop_detection() {
        let path = AsPathSpec {
            segments: vec![AsPathSegment::Sequence(vec![65000, 65001, 65000])],
        };
        assert!(path.as_path_loop(65000, 1));
        assert!(!path.as_path_loop(65001, 1));
    }

    #[test]
    fn test_prepend_opens_new_segment_past_sequence_cap() {
        let full = AsPathSpec {
            segments: vec![AsPathSegment::Sequence((0..255).collect())],
        };
        let grown = full.prepend(65000);
        assert_eq!(grown.segments.len(), 2);
        match &grown.segments[0] {
            AsPathSegment::Sequence(seq) => assert_eq!(seq, &vec![65000]),
            _ => panic!("expected a new leading sequence"),
        }
    }

    #[test]
    fn test_left_most_match() {
        let path = AsPathSpec {
            segments: vec![AsPathSegment::Sequence(vec![65000, 65001])],
        };
        assert!(path.as_left_most_match(65000));
        assert!(!path.as_left_most_match(65001));
    }
}
