//! Stack slots and the layout of the frame they live in.

use crate::lir::Kind;
use index_vec::IndexVec;

index_vec::define_index_type! {
    pub struct SlotIdx = u32;
}

/// The size, in bytes, of fixed and scratch slots: large enough to hold any [Kind].
const WORD_SIZE: usize = 8;

/// Keeps track of an abstract stack pointer for a frame during allocation. The abstract stack
/// pointer is zero-based, so the stack pointer value also serves as the size of the stack.
///
/// The implementation is platform agnostic: as the abstract stack gets bigger, the abstract stack
/// pointer grows upwards, even on architectures where the stack grows downwards.
#[derive(Clone, Debug, Default)]
struct AbstractStack(usize);

impl AbstractStack {
    /// Aligns the abstract stack pointer to `to` bytes, returning the newly aligned stack
    /// pointer.
    fn align(&mut self, to: usize) -> usize {
        let rem = self.0 % to;
        if rem != 0 {
            self.0 += to - rem;
        }
        self.0
    }

    /// Makes the stack bigger by `nbytes` bytes, returning the new stack pointer.
    fn grow(&mut self, nbytes: usize) -> usize {
        self.0 += nbytes;
        self.0
    }

    fn size(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StackSlot {
    /// The slot occupies the `size` bytes ending at `frame_off` bytes from the base of the frame.
    pub frame_off: u32,
    pub size: u32,
}

/// The stack slots of one compilation unit. Slots `0..n` are the unit's fixed slots (the `@n`
/// values of the LIR); spill and scratch slots are allocated after them.
#[derive(Clone, Debug)]
pub struct FrameMap {
    stack: AbstractStack,
    slots: IndexVec<SlotIdx, StackSlot>,
    /// Scratch slots used to break cycles in parallel moves. The `n`th cycle broken in a single
    /// parallel move uses the `n`th scratch slot, so slots are shared between move groups.
    scratch: Vec<SlotIdx>,
}

impl FrameMap {
    pub fn new(fixed_slots: usize) -> Self {
        let mut fm = Self {
            stack: AbstractStack::default(),
            slots: IndexVec::new(),
            scratch: Vec::new(),
        };
        for _ in 0..fixed_slots {
            fm.push_slot(WORD_SIZE);
        }
        fm
    }

    fn push_slot(&mut self, size: usize) -> SlotIdx {
        self.stack.align(size);
        let frame_off = self.stack.grow(size);
        self.slots.push(StackSlot {
            frame_off: u32::try_from(frame_off).unwrap(),
            size: u32::try_from(size).unwrap(),
        })
    }

    /// Allocate a new slot suitable for holding a value of kind `kind`.
    pub fn alloc_spill_slot(&mut self, kind: Kind) -> SlotIdx {
        self.push_slot(kind.byte_size())
    }

    /// Return the `nth` scratch slot, allocating it if necessary.
    pub(crate) fn scratch_slot(&mut self, nth: usize) -> SlotIdx {
        while self.scratch.len() <= nth {
            let slot = self.push_slot(WORD_SIZE);
            self.scratch.push(slot);
        }
        self.scratch[nth]
    }

    pub fn slot(&self, slot: SlotIdx) -> &StackSlot {
        &self.slots[slot]
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Compute the final layout of the frame. The frame size is rounded up to 16 bytes.
    pub fn layout(&self) -> FrameLayout {
        let mut stack = self.stack.clone();
        FrameLayout {
            size: u32::try_from(stack.align(16)).unwrap(),
            slots: self.slots.clone(),
        }
    }
}

/// The final frame handed to code emission.
#[derive(Clone, Debug)]
pub struct FrameLayout {
    pub size: u32,
    pub slots: IndexVec<SlotIdx, StackSlot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow() {
        let mut s = AbstractStack::default();
        assert_eq!(s.grow(8), 8);
        assert_eq!(s.grow(8), 16);
        assert_eq!(s.grow(1), 17);
        assert_eq!(s.grow(0), 17);
        assert_eq!(s.grow(1000), 1017);
    }

    #[test]
    fn align() {
        let mut s = AbstractStack::default();
        for i in 1..100 {
            assert_eq!(s.align(i), 0);
        }
        for i in 1..100 {
            s.grow(1);
            assert_eq!(s.align(1), i);
        }
        assert_eq!(s.align(8), 104);
        assert_eq!(s.size(), 104);
    }

    #[test]
    fn spill_slots() {
        let mut fm = FrameMap::new(1);
        assert_eq!(fm.slot(SlotIdx::from_usize(0)).frame_off, 8);
        let s1 = fm.alloc_spill_slot(Kind::I32);
        assert_eq!(fm.slot(s1), &StackSlot { frame_off: 12, size: 4 });
        let s2 = fm.alloc_spill_slot(Kind::F64);
        assert_eq!(fm.slot(s2), &StackSlot { frame_off: 24, size: 8 });
        let s3 = fm.alloc_spill_slot(Kind::Ref);
        assert_eq!(fm.slot(s3).frame_off, 32);
        assert_eq!(fm.num_slots(), 4);
        assert_eq!(fm.layout().size, 32);
        fm.alloc_spill_slot(Kind::I32);
        assert_eq!(fm.layout().size, 48);
    }

    #[test]
    fn scratch_slots_are_shared() {
        let mut fm = FrameMap::new(0);
        let a = fm.scratch_slot(0);
        assert_eq!(fm.scratch_slot(0), a);
        let b = fm.scratch_slot(2);
        assert_ne!(a, b);
        assert_eq!(fm.num_slots(), 3);
        assert_eq!(fm.scratch_slot(1), SlotIdx::from_usize(1));
    }
}
