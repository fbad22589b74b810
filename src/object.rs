// SPDX-License-Identifier: MIT OR Apache-2.0

//! The id-addressed object table shared with user space.
//!
//! User space never holds pointers, only [`ObjectId`]s. An id packs a slot index with the slot's
//! generation, so an id whose object was destroyed keeps resolving to
//! [`Error::NoSuchObject`](crate::error::Error::NoSuchObject) even after the slot is reused.
//!
//! Objects are published in two steps: [`ObjectTable::reserve`] hands out the id so the object can
//! be fully constructed knowing it, and only [`ObjectTable::finalize`] makes it visible to lookups.
//! Until then nothing else can observe or reference it, and [`ObjectTable::abort`] returns the id.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Display};
use std::sync::Arc;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::hwpt::HwPageTable;
use crate::ioas::Ioas;
use crate::sync::Mutex;

/* ---------------------------------------------------------------------------------------------- */

const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << (32 - INDEX_BITS)) - 1;

/// Identifies an IOAS, hardware page table, or device binding. Never zero.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(u32);

impl ObjectId {
    fn new(index: u32, generation: u32) -> ObjectId {
        ObjectId((generation << INDEX_BITS) | index)
    }

    /// Reinterprets a value received from user space. It may not refer to anything.
    pub fn from_raw(raw: u32) -> ObjectId {
        ObjectId(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    fn generation(self) -> u32 {
        self.0 >> INDEX_BITS
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object {}", self.0)
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[derive(Clone, Debug)]
pub enum Object {
    Ioas(Arc<Ioas>),
    Hwpt(Arc<HwPageTable>),
    Device(Arc<Device>),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Ioas(_) => "ioas",
            Object::Hwpt(_) => "hwpt",
            Object::Device(_) => "device",
        }
    }
}

#[derive(Debug)]
enum SlotState {
    Free,
    Reserved,
    Live(Object),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: SlotState,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct ObjectTable {
    inner: Mutex<Slots>,
}

impl ObjectTable {
    pub fn new() -> ObjectTable {
        ObjectTable::default()
    }

    /// Allocates an id whose lookups fail until [`ObjectTable::finalize`] is called.
    pub fn reserve(&self) -> Result<ObjectId> {
        let mut inner = self.inner.lock();

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                if inner.slots.len() > INDEX_MASK as usize {
                    return Err(Error::OutOfIds);
                }
                inner.slots.push(Slot {
                    generation: 1,
                    state: SlotState::Free,
                });
                inner.slots.len() - 1
            }
        };

        let slot = &mut inner.slots[index];
        slot.state = SlotState::Reserved;

        Ok(ObjectId::new(index as u32, slot.generation))
    }

    pub fn finalize(&self, id: ObjectId, object: Object) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id.index()];

        assert!(
            slot.generation == id.generation() && matches!(slot.state, SlotState::Reserved),
            "finalizing {} which was not reserved",
            id
        );
        slot.state = SlotState::Live(object);
    }

    /// Gives back an id obtained from [`ObjectTable::reserve`] that was never finalized.
    pub fn abort(&self, id: ObjectId) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id.index()];

        if slot.generation == id.generation() && matches!(slot.state, SlotState::Reserved) {
            Self::release_slot(&mut inner, id.index());
        }
    }

    pub fn get(&self, id: ObjectId) -> Result<Object> {
        let inner = self.inner.lock();

        match inner.slots.get(id.index()) {
            Some(Slot {
                generation,
                state: SlotState::Live(object),
            }) if *generation == id.generation() => Ok(object.clone()),
            _ => Err(Error::NoSuchObject(id)),
        }
    }

    /// Unpublishes the object. Its id will never resolve again.
    pub fn remove(&self, id: ObjectId) -> Result<Object> {
        let mut inner = self.inner.lock();

        let object = match inner.slots.get_mut(id.index()) {
            Some(slot) if slot.generation == id.generation() => {
                match std::mem::replace(&mut slot.state, SlotState::Free) {
                    SlotState::Live(object) => object,
                    other => {
                        slot.state = other;
                        return Err(Error::NoSuchObject(id));
                    }
                }
            }
            _ => return Err(Error::NoSuchObject(id)),
        };

        Self::release_slot(&mut inner, id.index());
        Ok(object)
    }

    fn release_slot(inner: &mut Slots, index: usize) {
        let slot = &mut inner.slots[index];
        slot.state = SlotState::Free;
        slot.generation = match (slot.generation + 1) & GENERATION_MASK {
            0 => 1,
            generation => generation,
        };
        inner.free.push(index);
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
