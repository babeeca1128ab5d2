//! Per-object-type slot table mapping small dense ids to live handles.
//!
//! Ids stay densely packed from 1 (id 0 is the null sentinel), so a
//! growable array suffices instead of a hash map. Generations give bounded
//! id reuse while still detecting use-after-free: a freed slot keeps its
//! generation, and every later `allocate` on that id must present a
//! strictly greater one.

use tracing::trace;

use crate::error::WireError;
use crate::handle::{ObjectHandle, ObjectType, NULL_OBJECT_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Id minted client-side before the server has finished asynchronously
    /// creating the real object; promotable to `Allocated` via
    /// [`ObjectTable::fill_reservation`], or released back to `Free`.
    Reserved,
    Allocated,
}

#[derive(Debug)]
struct Slot<T> {
    payload: Option<T>,
    generation: u32,
    state: SlotState,
}

#[derive(Debug)]
pub struct ObjectTable<T> {
    ty: ObjectType,
    /// Index 0 is the permanent null sentinel.
    slots: Vec<Slot<T>>,
    /// `(id, next generation)` pairs ready for reuse.
    free_list: Vec<ObjectHandle>,
}

impl<T> ObjectTable<T> {
    pub fn new(ty: ObjectType) -> Self {
        Self {
            ty,
            slots: vec![Slot {
                payload: None,
                generation: 0,
                state: SlotState::Free,
            }],
            free_list: Vec::new(),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.ty
    }

    /// Mints an id for a new object. Pops the free list if possible, else
    /// grows the table by one id. Never fails.
    pub fn reserve_handle(&mut self) -> ObjectHandle {
        if let Some(handle) = self.free_list.pop() {
            return handle;
        }
        ObjectHandle {
            id: self.slots.len() as u32,
            generation: 0,
        }
    }

    /// Binds `handle` to a slot in the given state.
    ///
    /// The id must be either an existing slot or exactly the next index;
    /// the slot must be `Free`; and for reused slots the generation must
    /// strictly exceed the previous occupant's.
    pub fn allocate(
        &mut self,
        handle: ObjectHandle,
        payload: Option<T>,
        state: SlotState,
    ) -> Result<(), WireError> {
        debug_assert!(state != SlotState::Free);
        if handle.id == NULL_OBJECT_ID {
            return Err(WireError::NullId(self.ty));
        }
        let index = handle.id as usize;
        if index > self.slots.len() {
            return Err(WireError::IdOutOfRange {
                ty: self.ty,
                id: handle.id,
            });
        }
        if index == self.slots.len() {
            trace!(ty = ?self.ty, id = handle.id, generation = handle.generation, "new slot");
            self.slots.push(Slot {
                payload,
                generation: handle.generation,
                state,
            });
            return Ok(());
        }

        let slot = &mut self.slots[index];
        if slot.state != SlotState::Free {
            return Err(WireError::SlotOccupied {
                ty: self.ty,
                id: handle.id,
            });
        }
        if handle.generation <= slot.generation {
            return Err(WireError::StaleGeneration {
                ty: self.ty,
                id: handle.id,
                generation: handle.generation,
                current: slot.generation,
            });
        }
        slot.generation = handle.generation;
        slot.state = state;
        slot.payload = payload;
        Ok(())
    }

    fn slot(&self, id: u32) -> Result<&Slot<T>, WireError> {
        if id == NULL_OBJECT_ID {
            return Err(WireError::NullId(self.ty));
        }
        self.slots.get(id as usize).ok_or(WireError::IdOutOfRange {
            ty: self.ty,
            id,
        })
    }

    /// Current state of an in-range slot.
    pub fn state(&self, id: u32) -> Result<SlotState, WireError> {
        Ok(self.slot(id)?.state)
    }

    /// Generation currently stored for an in-range slot.
    pub fn generation(&self, id: u32) -> Result<u32, WireError> {
        Ok(self.slot(id)?.generation)
    }

    /// Payload of a slot that must be `Allocated`.
    pub fn get_known(&self, id: u32) -> Result<&T, WireError> {
        let slot = self.slot(id)?;
        match (slot.state, slot.payload.as_ref()) {
            (SlotState::Allocated, Some(payload)) => Ok(payload),
            _ => Err(WireError::NotAllocated { ty: self.ty, id }),
        }
    }

    /// Lenient lookup for references arriving in return commands: a stale
    /// or absent `(id, generation)` pair resolves to `None`, never an
    /// error, because the local side may have already released the object.
    pub fn resolve(&self, handle: ObjectHandle) -> Option<&T> {
        let slot = self.slots.get(handle.id as usize)?;
        if handle.id == NULL_OBJECT_ID
            || slot.state != SlotState::Allocated
            || slot.generation != handle.generation
        {
            return None;
        }
        slot.payload.as_ref()
    }

    /// Promotes a `Reserved` slot to `Allocated`, storing the handle the
    /// asynchronous creation produced.
    pub fn fill_reservation(&mut self, id: u32, payload: T) -> Result<(), WireError> {
        if id == NULL_OBJECT_ID {
            return Err(WireError::NullId(self.ty));
        }
        let slot = self
            .slots
            .get_mut(id as usize)
            .ok_or(WireError::IdOutOfRange { ty: self.ty, id })?;
        if slot.state != SlotState::Reserved {
            return Err(WireError::NotReserved { ty: self.ty, id });
        }
        slot.state = SlotState::Allocated;
        slot.payload = Some(payload);
        Ok(())
    }

    /// Releases a slot, returning its payload for the caller to drop or
    /// hand back to the driver. The stored generation is preserved so the
    /// next `allocate` must exceed it. Once the generation would overflow,
    /// the id is permanently retired instead of re-entering the free list.
    pub fn free(&mut self, id: u32) -> Option<T> {
        let index = id as usize;
        if id == NULL_OBJECT_ID || index >= self.slots.len() {
            return None;
        }
        let slot = &mut self.slots[index];
        if slot.state == SlotState::Free {
            return None;
        }
        slot.state = SlotState::Free;
        let payload = slot.payload.take();
        if let Some(next_generation) = slot.generation.checked_add(1) {
            self.free_list.push(ObjectHandle {
                id,
                generation: next_generation,
            });
        } else {
            trace!(ty = ?self.ty, id, "generation exhausted, id retired");
        }
        payload
    }

    /// Drains every `Allocated` slot to `Free` and returns the payloads.
    /// Used only at full teardown so no handle is released twice when
    /// device destruction implicitly invalidates children.
    pub fn acquire_all_handles(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if slot.state == SlotState::Allocated {
                slot.state = SlotState::Free;
                if let Some(payload) = slot.payload.take() {
                    out.push(payload);
                }
            } else if slot.state == SlotState::Reserved {
                slot.state = SlotState::Free;
                slot.payload = None;
            }
        }
        out
    }

    /// Iterates over `(id, payload)` for every allocated slot.
    pub fn iter_allocated(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            match (slot.state, slot.payload.as_ref()) {
                (SlotState::Allocated, Some(payload)) => Some((id as u32, payload)),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ObjectTable<&'static str> {
        ObjectTable::new(ObjectType::Buffer)
    }

    #[test]
    fn reserve_allocate_free_reuses_id_with_bumped_generation() {
        let mut t = table();
        let h1 = t.reserve_handle();
        assert_eq!(h1, ObjectHandle { id: 1, generation: 0 });
        t.allocate(h1, Some("a"), SlotState::Allocated).unwrap();
        assert_eq!(t.free(h1.id), Some("a"));

        let h2 = t.reserve_handle();
        assert_eq!(h2, ObjectHandle { id: 1, generation: 1 });
        t.allocate(h2, Some("b"), SlotState::Allocated).unwrap();
        assert_eq!(t.get_known(1), Ok(&"b"));
    }

    #[test]
    fn generation_must_strictly_increase() {
        let mut t = table();
        let h = t.reserve_handle();
        t.allocate(h, Some("a"), SlotState::Allocated).unwrap();
        t.free(h.id);

        // Same generation as the previous occupant: rejected.
        assert!(matches!(
            t.allocate(h, Some("b"), SlotState::Allocated),
            Err(WireError::StaleGeneration { .. })
        ));
        // Strictly greater: accepted.
        t.allocate(
            ObjectHandle {
                id: h.id,
                generation: h.generation + 1,
            },
            Some("b"),
            SlotState::Allocated,
        )
        .unwrap();
    }

    #[test]
    fn id_far_beyond_table_length_is_rejected() {
        let mut t = table();
        let err = t
            .allocate(
                ObjectHandle { id: 5, generation: 0 },
                Some("x"),
                SlotState::Allocated,
            )
            .unwrap_err();
        assert!(matches!(err, WireError::IdOutOfRange { .. }));
    }

    #[test]
    fn null_id_is_rejected_everywhere() {
        let mut t = table();
        assert!(matches!(
            t.allocate(ObjectHandle::NULL, Some("x"), SlotState::Allocated),
            Err(WireError::NullId(ObjectType::Buffer))
        ));
        assert!(matches!(t.get_known(0), Err(WireError::NullId(_))));
        assert_eq!(t.free(0), None);
    }

    #[test]
    fn reserve_then_fail_scenario() {
        let mut t = table();
        // Grow the table so id 5 is exactly the next index.
        for _ in 0..4 {
            let h = t.reserve_handle();
            t.allocate(h, Some("pad"), SlotState::Allocated).unwrap();
        }

        t.allocate(
            ObjectHandle { id: 5, generation: 1 },
            None,
            SlotState::Reserved,
        )
        .unwrap();
        // Creation failed server-side; the reservation is freed without
        // ever calling fill_reservation.
        t.free(5);
        assert_eq!(t.state(5), Ok(SlotState::Free));
        assert_eq!(t.generation(5), Ok(1));

        assert!(matches!(
            t.allocate(
                ObjectHandle { id: 5, generation: 1 },
                Some("x"),
                SlotState::Allocated
            ),
            Err(WireError::StaleGeneration { .. })
        ));
        t.allocate(
            ObjectHandle { id: 5, generation: 2 },
            Some("x"),
            SlotState::Allocated,
        )
        .unwrap();
    }

    #[test]
    fn fill_reservation_requires_reserved_state() {
        let mut t = table();
        let h = t.reserve_handle();
        t.allocate(h, None, SlotState::Reserved).unwrap();
        t.fill_reservation(h.id, "native").unwrap();
        assert_eq!(t.get_known(h.id), Ok(&"native"));

        // A second fill on the now-allocated slot is a protocol violation.
        assert!(matches!(
            t.fill_reservation(h.id, "again"),
            Err(WireError::NotReserved { .. })
        ));
    }

    #[test]
    fn stale_resolve_returns_none() {
        let mut t = table();
        let h = t.reserve_handle();
        t.allocate(h, Some("a"), SlotState::Allocated).unwrap();
        t.free(h.id);
        assert_eq!(t.resolve(h), None);

        let h2 = t.reserve_handle();
        t.allocate(h2, Some("b"), SlotState::Allocated).unwrap();
        // Old generation still resolves to nothing even though the id is
        // live again.
        assert_eq!(t.resolve(h), None);
        assert_eq!(t.resolve(h2), Some(&"b"));
    }

    #[test]
    fn generation_overflow_retires_the_id() {
        let mut t = table();
        let h = t.reserve_handle();
        t.allocate(h, Some("a"), SlotState::Allocated).unwrap();
        t.free(h.id);

        // Simulate an occupant at the maximum generation.
        t.allocate(
            ObjectHandle {
                id: h.id,
                generation: u32::MAX,
            },
            Some("last"),
            SlotState::Allocated,
        )
        .unwrap();
        // Drop the free-list entry minted by the first free.
        t.free_list.clear();
        t.free(h.id);
        assert!(t.free_list.is_empty());

        // The next mint grows the table instead of reusing the retired id.
        let fresh = t.reserve_handle();
        assert_eq!(fresh.id, 2);
    }

    #[test]
    fn acquire_all_handles_drains_every_allocated_slot_once() {
        let mut t = table();
        for name in ["a", "b", "c"] {
            let h = t.reserve_handle();
            t.allocate(h, Some(name), SlotState::Allocated).unwrap();
        }
        let reserved = t.reserve_handle();
        t.allocate(reserved, None, SlotState::Reserved).unwrap();

        let mut drained = t.acquire_all_handles();
        drained.sort_unstable();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(t.acquire_all_handles().is_empty());
        assert_eq!(t.iter_allocated().count(), 0);
    }
}
