//! Octree/quadtree node names.
//!
//! A node is named by the path of octants taken from the root: a byte string
//! where every byte is a base-8 digit (0..=7), the empty string naming the root.
//! Names are cheap to compare, trivially serializable, and give the dispatcher
//! a total (lexicographic-by-length) order to prioritize deepest-first.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeName(Vec<u8>);

impl NodeName {
    pub fn root() -> Self {
        NodeName(Vec::new())
    }

    pub fn from_digits(digits: &[u8]) -> Self {
        debug_assert!(digits.iter().all(|d| *d < 8));
        NodeName(digits.to_vec())
    }

    pub fn digits(&self) -> &[u8] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Child of `self` selected by octant index `octant` (0..=7, or 0..=3 for quadtree nodes).
    pub fn child(&self, octant: u8) -> Self {
        debug_assert!(octant < 8);
        let mut digits = self.0.clone();
        digits.push(octant);
        NodeName(digits)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(NodeName(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// The octant of `self` under its parent, i.e. the last digit of the name.
    pub fn octant(&self) -> Option<u8> {
        self.0.last().copied()
    }

    /// Whether `self` is an ancestor of (or equal to) `other`: a prefix test.
    pub fn is_ancestor_of(&self, other: &NodeName) -> bool {
        self.0.len() <= other.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Splits the name into 8-char (or shorter, for the final remainder) path segments,
    /// for use in the NodeStore's sharded file layout. The file stem is the last segment,
    /// prefixed with `r`; an empty name collapses to `r`.
    pub fn path_segments(&self) -> (Vec<String>, String) {
        let as_chars: String = self.0.iter().map(|d| (b'0' + d) as char).collect();
        if as_chars.is_empty() {
            return (Vec::new(), "r".to_string());
        }
        let mut dirs = Vec::new();
        let mut rest = as_chars.as_str();
        while rest.len() > 8 {
            let (head, tail) = rest.split_at(8);
            dirs.push(head.to_string());
            rest = tail;
        }
        (dirs, format!("r{rest}"))
    }

    /// The sharded file path for this name under `base`, with `suffix`
    /// appended to the `r<segment>` stem (e.g. `"bin"` for spilled node
    /// payloads, `"pnts"` for finalized tiles) - both the NodeStore and the
    /// tile writer shard by the same rule, just under different roots.
    pub fn sharded_path(&self, base: &Path, suffix: &str) -> PathBuf {
        let (dirs, stem) = self.path_segments();
        let mut path = base.to_path_buf();
        for d in dirs {
            path.push(d);
        }
        path.push(format!("{stem}.{suffix}"));
        path
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.0 {
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_empty() {
        let root = NodeName::root();
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn child_appends_octant() {
        let root = NodeName::root();
        let c = root.child(5);
        assert_eq!(c.digits(), &[5]);
        let gc = c.child(2);
        assert_eq!(gc.digits(), &[5, 2]);
        assert_eq!(gc.parent(), Some(c.clone()));
        assert_eq!(gc.octant(), Some(2));
    }

    #[test]
    fn ancestor_is_prefix() {
        let a = NodeName::from_digits(&[1, 2]);
        let b = NodeName::from_digits(&[1, 2, 3, 4]);
        let c = NodeName::from_digits(&[1, 3]);
        assert!(a.is_ancestor_of(&b));
        assert!(a.is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&c));
        assert!(!b.is_ancestor_of(&a));
    }

    #[test]
    fn path_segments_shard_every_8_chars() {
        let name = NodeName::from_digits(&[1; 10]);
        let (dirs, stem) = name.path_segments();
        assert_eq!(dirs, vec!["11111111".to_string()]);
        assert_eq!(stem, "r11");
    }

    #[test]
    fn empty_name_collapses_to_r() {
        let (dirs, stem) = NodeName::root().path_segments();
        assert!(dirs.is_empty());
        assert_eq!(stem, "r");
    }
}
