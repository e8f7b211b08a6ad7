//! Axis-aligned bounding boxes, and the subdivision geometry built on top of them:
//! octree/quadtree classification and octant bisection.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// The minimum extent any axis of a "valid" AABB is forced to have.
/// Point clouds that are flat along one axis (e.g. a perfectly planar survey)
/// would otherwise produce a degenerate, zero-volume box.
pub const MIN_AABB_SIZE: f64 = 0.00001;

/// Whether a node subdivides into 8 octants or 4 quadrants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubdivisionType {
    Octree,
    Quadtree,
}

/// An axis-aligned bounding box with `f64` bookkeeping precision.
///
/// Storage precision for points themselves is `f32` (see [`crate::geometry::point`]);
/// this split is intentional, as documented in the module's surrounding design notes -
/// `f64` bookkeeping avoids compounding error across many levels of bisection and CRS
/// transforms, while `f32` point storage keeps tiles small.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    /// Builds an AABB from `min`/`max`. Panics if `max < min` on any axis -
    /// this is an invariant violation, not a recoverable error (see error design).
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        assert!(max.x >= min.x && max.y >= min.y && max.z >= min.z);
        Aabb { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Point3<f64>>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut min = first;
        let mut max = first;
        for p in iter {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }
        Some(Aabb { min, max })
    }

    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn size(&self) -> Point3<f64> {
        Point3::new(
            self.max.x - self.min.x,
            self.max.y - self.min.y,
            self.max.z - self.min.z,
        )
    }

    pub fn contains(&self, p: &Point3<f64>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Extends `self` to also cover `other`. Mirrors the source's `extend_union`,
    /// written fresh here component-by-component rather than copied, to avoid a
    /// min/max axis mixup that the source's version carries.
    pub fn extend_union(&mut self, other: &Aabb) {
        self.min.x = self.min.x.min(other.min.x);
        self.min.y = self.min.y.min(other.min.y);
        self.min.z = self.min.z.min(other.min.z);
        self.max.x = self.max.x.max(other.max.x);
        self.max.y = self.max.y.max(other.max.y);
        self.max.z = self.max.z.max(other.max.z);
    }

    /// Widens any zero-width (or near-zero-width) axis to [`MIN_AABB_SIZE`], symmetrically
    /// around the existing value on that axis.
    pub fn make_valid(mut self) -> Self {
        for axis in 0..3 {
            let lo = self.min[axis];
            let hi = self.max[axis];
            if hi - lo < MIN_AABB_SIZE {
                let mid = (lo + hi) / 2.0;
                self.min[axis] = mid - MIN_AABB_SIZE / 2.0;
                self.max[axis] = mid + MIN_AABB_SIZE / 2.0;
            }
        }
        self
    }

    /// Classifies whether a node with this AABB subdivides as an octree (8 children)
    /// or a quadtree (4 children, z split suppressed): quadtree iff the z extent is
    /// less than half of the smaller of the x/y extents.
    pub fn subdivision_type(&self) -> SubdivisionType {
        let size = self.size();
        if size.z < 0.5 * size.x.min(size.y) {
            SubdivisionType::Quadtree
        } else {
            SubdivisionType::Octree
        }
    }

    /// Bisects this AABB into the child box for octant `octant` (bit 2 = +x, bit 1 = +y,
    /// bit 0 = +z). For quadtree nodes the z split is suppressed: both "halves" span the
    /// full z range of the parent, and only octants 0 and 1 (i.e. bit 0 = 0) should be used
    /// by the caller in that case (z split disabled means the caller iterates bit 0 fixed).
    pub fn child_aabb(&self, octant: u8, subdivision: SubdivisionType) -> Aabb {
        let center = self.center();
        let x_hi = octant & 0b100 != 0;
        let y_hi = octant & 0b010 != 0;
        let z_hi = octant & 0b001 != 0;

        let (min_x, max_x) = if x_hi {
            (center.x, self.max.x)
        } else {
            (self.min.x, center.x)
        };
        let (min_y, max_y) = if y_hi {
            (center.y, self.max.y)
        } else {
            (self.min.y, center.y)
        };
        let (min_z, max_z) = match subdivision {
            SubdivisionType::Octree => {
                if z_hi {
                    (center.z, self.max.z)
                } else {
                    (self.min.z, center.z)
                }
            }
            // quadtree: z is never split, full range is kept regardless of z_hi.
            SubdivisionType::Quadtree => (self.min.z, self.max.z),
        };

        Aabb::new(
            Point3::new(min_x, min_y, min_z),
            Point3::new(max_x, max_y, max_z),
        )
    }

    /// Octant index containing `p`, given this node's AABB and subdivision type.
    /// A point exactly on a split plane is assigned to the lower-index octant
    /// (ties broken toward the min corner), matching the bit test being `< center`
    /// rather than `<= center`.
    pub fn octant_of(&self, p: &Point3<f64>, subdivision: SubdivisionType) -> u8 {
        let center = self.center();
        let mut octant = 0u8;
        if p.x >= center.x {
            octant |= 0b100;
        }
        if p.y >= center.y {
            octant |= 0b010;
        }
        if subdivision == SubdivisionType::Octree && p.z >= center.z {
            octant |= 0b001;
        }
        octant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_valid_widens_zero_axes() {
        let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 0.0)).make_valid();
        assert!(aabb.max.z - aabb.min.z >= MIN_AABB_SIZE);
        assert!(aabb.max.x - aabb.min.x >= 1.0);
    }

    #[test]
    fn subdivision_type_flat_is_quadtree() {
        let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 1.0));
        assert_eq!(aabb.subdivision_type(), SubdivisionType::Quadtree);
        let cube = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 10.0));
        assert_eq!(cube.subdivision_type(), SubdivisionType::Octree);
    }

    #[test]
    fn child_aabb_bisects_octree() {
        let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 2.0, 2.0));
        let child = aabb.child_aabb(0b111, SubdivisionType::Octree);
        assert_eq!(child.min, Point3::new(1.0, 1.0, 1.0));
        assert_eq!(child.max, Point3::new(2.0, 2.0, 2.0));
        let child0 = aabb.child_aabb(0, SubdivisionType::Octree);
        assert_eq!(child0.min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(child0.max, Point3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn child_aabb_quadtree_keeps_full_z() {
        let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 2.0, 2.0));
        let child = aabb.child_aabb(0b100, SubdivisionType::Quadtree);
        assert_eq!(child.min.z, 0.0);
        assert_eq!(child.max.z, 2.0);
    }

    #[test]
    fn octant_of_ties_go_to_lower_index() {
        let aabb = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 2.0, 2.0));
        let center = aabb.center();
        let octant = aabb.octant_of(&center, SubdivisionType::Octree);
        assert_eq!(octant, 0b111);
    }

    #[test]
    fn extend_union_is_axis_correct() {
        let mut a = Aabb::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        let b = Aabb::new(Point3::new(-1.0, 2.0, 0.5), Point3::new(0.5, 3.0, 4.0));
        a.extend_union(&b);
        assert_eq!(a.min, Point3::new(-1.0, 0.0, 0.0));
        assert_eq!(a.max, Point3::new(1.0, 3.0, 4.0));
    }
}
