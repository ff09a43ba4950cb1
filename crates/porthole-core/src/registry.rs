use std::os::fd::RawFd;

use crate::error::{InterceptError, InterceptResult};

/// Maximum number of concurrently tracked descriptors.
///
/// Filesystem tools open the image a handful of times at most; running past
/// this bound means descriptor lifecycle tracking has diverged from reality,
/// which must fail loudly rather than let untranslated offsets through.
pub const CAPACITY: usize = 16;

/// Fixed-capacity set of file descriptors known to reference the target file.
///
/// Slots hold `Option<RawFd>` so that a legitimate descriptor value of 0 is
/// representable; the slot state is the occupancy flag, not the value.
#[derive(Debug)]
pub struct FdRegistry {
    slots: [Option<RawFd>; CAPACITY],
}

impl FdRegistry {
    /// An empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; CAPACITY],
        }
    }

    /// Whether `fd` is currently tracked.
    #[must_use]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.slots.contains(&Some(fd))
    }

    /// Track a descriptor.
    ///
    /// # Errors
    ///
    /// [`InterceptError::DuplicateDescriptor`] if `fd` is already present,
    /// [`InterceptError::RegistryFull`] if every slot is occupied. Both are
    /// fatal to the caller.
    pub fn insert(&mut self, fd: RawFd) -> InterceptResult<()> {
        if self.contains(fd) {
            return Err(InterceptError::DuplicateDescriptor(fd));
        }
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(fd);
                Ok(())
            }
            None => Err(InterceptError::RegistryFull { capacity: CAPACITY }),
        }
    }

    /// Stop tracking a descriptor.
    ///
    /// # Errors
    ///
    /// [`InterceptError::UntrackedDescriptor`] if `fd` is not present; the
    /// registry and the real descriptor lifecycle have diverged.
    pub fn remove(&mut self, fd: RawFd) -> InterceptResult<()> {
        match self.slots.iter_mut().find(|slot| **slot == Some(fd)) {
            Some(slot) => {
                *slot = None;
                Ok(())
            }
            None => Err(InterceptError::UntrackedDescriptor(fd)),
        }
    }

    /// Number of tracked descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether no descriptor is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Drop every tracked descriptor.
    pub fn clear(&mut self) {
        self.slots = [None; CAPACITY];
    }
}

impl Default for FdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains_remove() {
        let mut registry = FdRegistry::new();
        assert!(!registry.contains(7));
        registry.insert(7).unwrap();
        assert!(registry.contains(7));
        assert_eq!(registry.len(), 1);
        registry.remove(7).unwrap();
        assert!(!registry.contains(7));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_descriptor_zero_is_representable() {
        let mut registry = FdRegistry::new();
        registry.insert(0).unwrap();
        assert!(registry.contains(0));
        registry.remove(0).unwrap();
        assert!(!registry.contains(0));
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut registry = FdRegistry::new();
        registry.insert(3).unwrap();
        assert_eq!(
            registry.insert(3),
            Err(InterceptError::DuplicateDescriptor(3))
        );
    }

    #[test]
    fn test_full_registry_rejects_insert() {
        let mut registry = FdRegistry::new();
        for fd in 0..CAPACITY {
            registry.insert(RawFd::try_from(fd).unwrap()).unwrap();
        }
        let overflow = registry.insert(99);
        assert_eq!(
            overflow,
            Err(InterceptError::RegistryFull { capacity: CAPACITY })
        );
        assert!(overflow.unwrap_err().is_fatal());
    }

    #[test]
    fn test_remove_untracked_is_fatal() {
        let mut registry = FdRegistry::new();
        let err = registry.remove(5).unwrap_err();
        assert_eq!(err, InterceptError::UntrackedDescriptor(5));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_slots_are_reusable() {
        let mut registry = FdRegistry::new();
        for fd in 0..CAPACITY {
            registry.insert(RawFd::try_from(fd).unwrap()).unwrap();
        }
        registry.remove(4).unwrap();
        registry.insert(42).unwrap();
        assert!(registry.contains(42));
        assert_eq!(registry.len(), CAPACITY);
    }
}
