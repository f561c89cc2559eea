use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// The resource vector checked against node limits. All components are
/// non-negative; value semantics throughout.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResources {
    pub cpu: f64,
    /// Memory in bytes.
    pub memory: i64,
    pub user_slots: i32,
    pub network: i64,
}

impl JobResources {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn new(cpu: f64, memory: i64, user_slots: i32, network: i64) -> Self {
        Self {
            cpu,
            memory,
            user_slots,
            network,
        }
    }

    /// Component-wise `self >= other`.
    pub fn dominates(&self, other: &JobResources) -> bool {
        self.cpu >= other.cpu
            && self.memory >= other.memory
            && self.user_slots >= other.user_slots
            && self.network >= other.network
    }

    /// Component-wise minimum, used for group resource floors.
    pub fn component_min(&self, other: &JobResources) -> JobResources {
        JobResources {
            cpu: self.cpu.min(other.cpu),
            memory: self.memory.min(other.memory),
            user_slots: self.user_slots.min(other.user_slots),
            network: self.network.min(other.network),
        }
    }

    /// Scales every component by a job count.
    pub fn scaled(&self, count: i64) -> Self {
        Self {
            cpu: self.cpu * count as f64,
            memory: self.memory * count,
            user_slots: self.user_slots * count as i32,
            network: self.network * count,
        }
    }
}

impl Add for JobResources {
    type Output = JobResources;

    fn add(self, other: JobResources) -> JobResources {
        JobResources {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
            user_slots: self.user_slots + other.user_slots,
            network: self.network + other.network,
        }
    }
}

impl AddAssign for JobResources {
    fn add_assign(&mut self, other: JobResources) {
        *self = *self + other;
    }
}

impl Sub for JobResources {
    type Output = JobResources;

    fn sub(self, other: JobResources) -> JobResources {
        JobResources {
            cpu: self.cpu - other.cpu,
            memory: self.memory - other.memory,
            user_slots: self.user_slots - other.user_slots,
            network: self.network - other.network,
        }
    }
}

impl SubAssign for JobResources {
    fn sub_assign(&mut self, other: JobResources) {
        *self = *self - other;
    }
}

impl fmt::Display for JobResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{cpu: {:.2}, memory: {}MiB, user_slots: {}, network: {}}}",
            self.cpu,
            self.memory / (1024 * 1024),
            self.user_slots,
            self.network
        )
    }
}

/// The raw resource ask produced by a task before memory reserve
/// calibration. Memory is split into the parts that are calibrated
/// independently: the fixed footprint, the job proxy overhead, and the
/// user job allocation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedJobResources {
    pub cpu: f64,
    pub user_slots: i32,
    pub footprint_memory: i64,
    pub job_proxy_memory: i64,
    pub user_job_memory: i64,
    pub network: i64,
}

impl ExtendedJobResources {
    /// Folds the memory split into a flat reservation. The job proxy and
    /// user job components are scaled by their digest-derived factors; a
    /// zero user job ask stays exactly zero.
    pub fn apply_memory_reserve(
        &self,
        job_proxy_factor: f64,
        user_job_factor: f64,
    ) -> JobResources {
        let mut memory = self.footprint_memory;
        memory += (self.job_proxy_memory as f64 * job_proxy_factor) as i64;
        memory += (self.user_job_memory as f64 * user_job_factor) as i64;
        JobResources {
            cpu: self.cpu,
            memory,
            user_slots: self.user_slots,
            network: self.network,
        }
    }
}
