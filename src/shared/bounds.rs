use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Octant direction within a node: bit 0 is x at-or-above the midpoint,
/// bit 1 is y, bit 2 is z.
pub type Dir = u8;

pub const DIR_END: u8 = 8;

pub fn dir_of(mid: DVec3, point: DVec3) -> Dir {
    let mut dir = 0u8;
    if point.x >= mid.x {
        dir |= 1;
    }
    if point.y >= mid.y {
        dir |= 2;
    }
    if point.z >= mid.z {
        dir |= 4;
    }
    dir
}

/// Axis-aligned cube in dataset coordinates. The root bounds is a cube; all
/// descendants are obtained by halving, so cube-ness is preserved.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 6]", into = "[f64; 6]")]
pub struct Bounds {
    min: DVec3,
    max: DVec3,
}

impl Bounds {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Smallest cube centered on `inner` that contains it.
    pub fn cube(inner: Bounds) -> Self {
        let mid = inner.mid();
        let extent = inner.max - inner.min;
        let radius = extent.x.max(extent.y).max(extent.z) / 2.0;
        let radius = if radius > 0.0 { radius } else { 0.5 };
        Self {
            min: mid - DVec3::splat(radius),
            max: mid + DVec3::splat(radius),
        }
    }

    pub fn min(&self) -> DVec3 {
        self.min
    }

    pub fn max(&self) -> DVec3 {
        self.max
    }

    pub fn mid(&self) -> DVec3 {
        (self.min + self.max) / 2.0
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn contains(&self, point: DVec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn intersection(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    pub fn grow(&mut self, point: DVec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Halve toward octant `dir`.
    pub fn go(&mut self, dir: Dir) {
        let mid = self.mid();
        if dir & 1 != 0 {
            self.min.x = mid.x;
        } else {
            self.max.x = mid.x;
        }
        if dir & 2 != 0 {
            self.min.y = mid.y;
        } else {
            self.max.y = mid.y;
        }
        if dir & 4 != 0 {
            self.min.z = mid.z;
        } else {
            self.max.z = mid.z;
        }
    }

    pub fn get(&self, dir: Dir) -> Bounds {
        let mut child = *self;
        child.go(dir);
        child
    }

    /// Accumulator identity: grows to the first point it sees.
    pub fn everted() -> Self {
        Self {
            min: DVec3::splat(f64::MAX),
            max: DVec3::splat(f64::MIN),
        }
    }
}

impl From<[f64; 6]> for Bounds {
    fn from(v: [f64; 6]) -> Self {
        Self {
            min: DVec3::new(v[0], v[1], v[2]),
            max: DVec3::new(v[3], v[4], v[5]),
        }
    }
}

impl From<Bounds> for [f64; 6] {
    fn from(b: Bounds) -> Self {
        [b.min.x, b.min.y, b.min.z, b.max.x, b.max.y, b.max.z]
    }
}
