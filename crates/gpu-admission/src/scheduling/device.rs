use core::error::Error;

use crate::k8s::resources::HUNDRED_CORE;

/// Usage counters for one GPU device within a node. Request-local: built for
/// a single admission decision and discarded with it, so reservations are
/// never removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    id: usize,
    total_memory: u64,
    used_memory: u64,
    used_core: u64,
}

/// Reservation rejected because a counter would exceed its ceiling.
#[derive(Debug, derive_more::Display)]
pub enum DeviceError {
    #[display("device {id}: core overcommit, requested {requested}, already used {used}")]
    CoreOvercommit {
        id: usize,
        requested: u64,
        used: u64,
    },
    #[display(
        "device {id}: memory overcommit, requested {requested}, already used {used} of {total}"
    )]
    MemoryOvercommit {
        id: usize,
        requested: u64,
        used: u64,
        total: u64,
    },
}

impl Error for DeviceError {}

impl Device {
    pub fn new(id: usize, total_memory: u64) -> Self {
        Self {
            id,
            total_memory,
            used_memory: 0,
            used_core: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    pub fn used_core(&self) -> u64 {
        self.used_core
    }

    pub fn used_memory(&self) -> u64 {
        self.used_memory
    }

    pub fn allocatable_cores(&self) -> u64 {
        HUNDRED_CORE - self.used_core
    }

    pub fn allocatable_memory(&self) -> u64 {
        self.total_memory - self.used_memory
    }

    /// Whether a `(cores, memory)` request fits the remaining capacity.
    pub fn can_allocate(&self, cores: u64, memory: u64) -> bool {
        self.allocatable_cores() >= cores && self.allocatable_memory() >= memory
    }

    /// Record a reservation. Both counters are checked before either moves,
    /// keeping the invariants `used_core <= 100` and
    /// `used_memory <= total_memory` under all inputs.
    pub fn reserve(&mut self, cores: u64, memory: u64) -> Result<(), DeviceError> {
        if self.used_core + cores > HUNDRED_CORE {
            return Err(DeviceError::CoreOvercommit {
                id: self.id,
                requested: cores,
                used: self.used_core,
            });
        }
        if self.used_memory + memory > self.total_memory {
            return Err(DeviceError::MemoryOvercommit {
                id: self.id,
                requested: memory,
                used: self.used_memory,
                total: self.total_memory,
            });
        }

        self.used_core += cores;
        self.used_memory += memory;
        Ok(())
    }
}
