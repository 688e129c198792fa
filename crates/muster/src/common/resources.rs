use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Index, IndexMut, Mul, Sub, SubAssign};

/// Tolerance used when comparing resource quantities. Smooths over
/// rounding from repeated add/sub of task demands and racing status
/// updates; a persistent violation beyond it drives preemption.
pub const RESOURCE_EPS: f64 = 1e-6;

pub const RESOURCE_KIND_COUNT: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Gpu,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; RESOURCE_KIND_COUNT] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::Gpu,
    ];

    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size vector of resource quantities, one slot per [`ResourceKind`].
///
/// Quantities are fractional (0.5 CPUs is a valid demand). All comparisons
/// go through [`RESOURCE_EPS`].
#[derive(Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector([f64; RESOURCE_KIND_COUNT]);

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector([0.0; RESOURCE_KIND_COUNT]);

    #[inline]
    pub fn new(cpu: f64, memory: f64, disk: f64, gpu: f64) -> Self {
        ResourceVector([cpu, memory, disk, gpu])
    }

    /// Vector with the same `value` in every slot.
    #[inline]
    pub fn uniform(value: f64) -> Self {
        ResourceVector([value; RESOURCE_KIND_COUNT])
    }

    #[inline]
    pub fn get(&self, kind: ResourceKind) -> f64 {
        self.0[kind.index()]
    }

    #[inline]
    pub fn set(&mut self, kind: ResourceKind, value: f64) {
        self.0[kind.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, f64)> + '_ {
        ResourceKind::ALL.iter().map(move |&k| (k, self.get(k)))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v <= RESOURCE_EPS)
    }

    /// True if this vector fits into `available` in every dimension.
    pub fn fits_in(&self, available: &ResourceVector) -> bool {
        self.0
            .iter()
            .zip(available.0.iter())
            .all(|(d, a)| *d <= *a + RESOURCE_EPS)
    }

    /// First dimension in which this vector exceeds `bound`, if any.
    pub fn exceeds(&self, bound: &ResourceVector) -> Option<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| self.get(*k) > bound.get(*k) + RESOURCE_EPS)
    }

    /// Per-dimension subtraction clamped at zero.
    pub fn sub_clamped(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = *self;
        for (slot, sub) in out.0.iter_mut().zip(other.0.iter()) {
            *slot = (*slot - *sub).max(0.0);
        }
        out
    }

    /// Cap every dimension at the corresponding dimension of `limit`.
    pub fn cap_at(&self, limit: &ResourceVector) -> ResourceVector {
        let mut out = *self;
        for (slot, cap) in out.0.iter_mut().zip(limit.0.iter()) {
            *slot = slot.min(*cap);
        }
        out
    }

    /// Per-dimension maximum.
    pub fn max_with(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = *self;
        for (slot, v) in out.0.iter_mut().zip(other.0.iter()) {
            *slot = slot.max(*v);
        }
        out
    }

    /// Lexicographic size ordering (cpu, then memory, disk, gpu). Used by
    /// placement strategies to sort demands and free capacities.
    pub fn cmp_size(&self, other: &ResourceVector) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    /// Stable hashable key; used to group equal demands together.
    pub fn bits_key(&self) -> [u64; RESOURCE_KIND_COUNT] {
        [
            self.0[0].to_bits(),
            self.0[1].to_bits(),
            self.0[2].to_bits(),
            self.0[3].to_bits(),
        ]
    }
}

impl Index<ResourceKind> for ResourceVector {
    type Output = f64;

    #[inline]
    fn index(&self, kind: ResourceKind) -> &f64 {
        &self.0[kind.index()]
    }
}

impl IndexMut<ResourceKind> for ResourceVector {
    #[inline]
    fn index_mut(&mut self, kind: ResourceKind) -> &mut f64 {
        &mut self.0[kind.index()]
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(mut self, rhs: ResourceVector) -> ResourceVector {
        self += rhs;
        self
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: ResourceVector) {
        for (slot, v) in self.0.iter_mut().zip(rhs.0.iter()) {
            *slot += *v;
        }
    }
}

impl Sub for ResourceVector {
    type Output = ResourceVector;

    fn sub(mut self, rhs: ResourceVector) -> ResourceVector {
        self -= rhs;
        self
    }
}

impl SubAssign for ResourceVector {
    fn sub_assign(&mut self, rhs: ResourceVector) {
        for (slot, v) in self.0.iter_mut().zip(rhs.0.iter()) {
            *slot -= *v;
        }
    }
}

impl Mul<f64> for ResourceVector {
    type Output = ResourceVector;

    fn mul(mut self, rhs: f64) -> ResourceVector {
        for slot in self.0.iter_mut() {
            *slot *= rhs;
        }
        self
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu:{} mem:{} disk:{} gpu:{}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Debug for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
