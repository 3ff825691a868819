use crate::shared::schema;
use glam::DVec3;

/// Slot index into a `MemBlock`, stable for the life of the block.
pub type Slot = usize;

/// Bump-allocated arena of fixed-width point records. Pages never move once
/// allocated, so a slot index stays valid until the owning chunk is dropped.
/// Not thread-safe; the owner serializes access.
pub struct MemBlock {
    point_size: usize,
    per_page: usize,
    pages: Vec<Box<[u8]>>,
    len: usize,
}

impl MemBlock {
    pub fn new(point_size: usize, per_page: usize) -> Self {
        assert!(point_size > 0 && per_page > 0);
        Self {
            point_size,
            per_page,
            pages: Vec::new(),
            len: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.len as u64
    }

    pub fn point_size(&self) -> usize {
        self.point_size
    }

    /// Claim the next record slot, zero-filled.
    pub fn alloc(&mut self) -> Slot {
        let slot = self.len;
        if slot / self.per_page == self.pages.len() {
            self.pages
                .push(vec![0u8; self.per_page * self.point_size].into_boxed_slice());
        }
        self.len += 1;
        slot
    }

    pub fn record(&self, slot: Slot) -> &[u8] {
        assert!(slot < self.len, "slot out of range");
        let start = (slot % self.per_page) * self.point_size;
        &self.pages[slot / self.per_page][start..start + self.point_size]
    }

    pub fn record_mut(&mut self, slot: Slot) -> &mut [u8] {
        assert!(slot < self.len, "slot out of range");
        let start = (slot % self.per_page) * self.point_size;
        &mut self.pages[slot / self.per_page][start..start + self.point_size]
    }

    /// Live records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        (0..self.len).map(move |slot| self.record(slot))
    }
}

/// One point record in flight: its coordinates plus the full record bytes.
/// The record travels through grid placement, displacement, overflow, and
/// splits; the bytes always embed the coordinates at offset zero.
#[derive(Clone, Debug)]
pub struct Voxel {
    point: DVec3,
    data: Vec<u8>,
}

impl Voxel {
    /// Wrap a record produced by a reader table.
    pub fn init_shallow(point: DVec3, data: &[u8]) -> Self {
        Self {
            point,
            data: data.to_vec(),
        }
    }

    pub fn point(&self) -> DVec3 {
        self.point
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_point(&mut self, point: DVec3) {
        self.point = point;
        schema::write_point(&mut self.data, point);
    }

    /// Copy this record into an owned slot.
    pub fn write_to(&self, slot_bytes: &mut [u8]) {
        slot_bytes.copy_from_slice(&self.data);
    }

    /// Exchange records with a grid slot: the incoming point takes the slot
    /// and this voxel continues carrying the displaced record.
    pub fn swap_deep(&mut self, slot_bytes: &mut [u8]) {
        self.data.as_mut_slice().swap_with_slice(slot_bytes);
        self.point = schema::read_point(&self.data);
    }
}
