use core::fmt;

/// Identity of an object on the wire.
///
/// `id` indexes a slot in the per-type [`ObjectTable`](crate::table::ObjectTable);
/// `generation` tells successive tenants of the same slot apart. Id 0 is the
/// null object and is never allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    pub id: u32,
    pub generation: u32,
}

impl ObjectHandle {
    pub const NULL: Self = Self { id: 0, generation: 0 };

    pub const fn new(id: u32, generation: u32) -> Self {
        Self { id, generation }
    }

    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.id, self.generation)
    }
}
