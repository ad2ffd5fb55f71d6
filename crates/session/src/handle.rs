//! Allocates opaque 32-bit async operation handles.
//!
//! Eight independent classes share the handle space by stealing the top 3
//! bits as a tag; each class counts up from 1 and wraps back to 1 rather
//! than 0, since 0 is reserved to mean "no handle" (an internal send).

const TYPE_MASK: u32 = 0xE000_0000;
const COUNTER_MASK: u32 = !TYPE_MASK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleClass {
    Enum,
    Connect,
    Send,
    PlayerInfo,
    CreateGroup,
    DestroyGroup,
    AddToGroup,
    RemoveFromGroup,
}

impl HandleClass {
    fn tag(self) -> u32 {
        match self {
            Self::Enum => 0x0000_0000,
            Self::Connect => 0x2000_0000,
            Self::Send => 0x4000_0000,
            Self::PlayerInfo => 0x6000_0000,
            Self::CreateGroup => 0x8000_0000,
            Self::DestroyGroup => 0xA000_0000,
            Self::AddToGroup => 0xC000_0000,
            Self::RemoveFromGroup => 0xE000_0000,
        }
    }

    pub fn of(handle: u32) -> Option<Self> {
        Some(match handle & TYPE_MASK {
            0x0000_0000 => Self::Enum,
            0x2000_0000 => Self::Connect,
            0x4000_0000 => Self::Send,
            0x6000_0000 => Self::PlayerInfo,
            0x8000_0000 => Self::CreateGroup,
            0xA000_0000 => Self::DestroyGroup,
            0xC000_0000 => Self::AddToGroup,
            0xE000_0000 => Self::RemoveFromGroup,
            _ => unreachable!("all 8 three-bit tag values are covered above"),
        })
    }
}

/// Issues async handles for the eight operation classes.
///
/// Handles are never tracked here; this is a pure counter. The instance's
/// own tables are what make a handle meaningful, this allocator only
/// guarantees it won't hand out the same value twice for a very long time.
#[derive(Debug)]
pub struct HandleAllocator {
    next: [u32; 8],
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self { next: [1; 8] }
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn class_index(class: HandleClass) -> usize {
        match class {
            HandleClass::Enum => 0,
            HandleClass::Connect => 1,
            HandleClass::Send => 2,
            HandleClass::PlayerInfo => 3,
            HandleClass::CreateGroup => 4,
            HandleClass::DestroyGroup => 5,
            HandleClass::AddToGroup => 6,
            HandleClass::RemoveFromGroup => 7,
        }
    }

    pub fn allocate(&mut self, class: HandleClass) -> u32 {
        let slot = &mut self.next[Self::class_index(class)];

        let handle = *slot | class.tag();

        *slot = (*slot + 1) & COUNTER_MASK;
        if *slot == 0 {
            *slot = 1;
        }

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_handle_of_each_class_is_counter_one() {
        let mut alloc = HandleAllocator::new();

        assert_eq!(alloc.allocate(HandleClass::Enum), 0x0000_0001);
        assert_eq!(alloc.allocate(HandleClass::Connect), 0x2000_0001);
        assert_eq!(alloc.allocate(HandleClass::Send), 0x4000_0001);
        assert_eq!(alloc.allocate(HandleClass::RemoveFromGroup), 0xE000_0001);
    }

    #[test]
    fn counter_increments_within_a_class() {
        let mut alloc = HandleAllocator::new();

        assert_eq!(alloc.allocate(HandleClass::Send), 0x4000_0001);
        assert_eq!(alloc.allocate(HandleClass::Send), 0x4000_0002);
        assert_eq!(alloc.allocate(HandleClass::Send), 0x4000_0003);
    }

    #[test]
    fn classes_are_independent() {
        let mut alloc = HandleAllocator::new();

        alloc.allocate(HandleClass::Send);
        alloc.allocate(HandleClass::Send);
        assert_eq!(alloc.allocate(HandleClass::Enum), 0x0000_0001);
    }

    #[test]
    fn counter_wraps_to_one_not_zero() {
        let mut alloc = HandleAllocator::new();
        alloc.next[HandleAllocator::class_index(HandleClass::Enum)] = COUNTER_MASK;

        let handle = alloc.allocate(HandleClass::Enum);
        assert_eq!(handle, COUNTER_MASK);
        assert_eq!(alloc.allocate(HandleClass::Enum), 0x0000_0001);
    }

    #[test]
    fn handle_class_of_round_trips() {
        let mut alloc = HandleAllocator::new();
        let h = alloc.allocate(HandleClass::CreateGroup);
        assert_eq!(HandleClass::of(h), Some(HandleClass::CreateGroup));
    }
}
