//! Worker pool configuration

use serde::{Deserialize, Serialize};

/// Pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Scale-down floor
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Hard ceiling on instances and on concurrently busy workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Instances created at startup when `instances` is empty
    #[serde(default = "default_initial_workers")]
    pub initial_workers: usize,
    /// Capacity weight for instances created without an explicit spec
    #[serde(default = "default_weight")]
    pub default_weight: u32,
    /// Region tag for instances created without an explicit spec
    #[serde(default)]
    pub default_region: Option<String>,
    /// Explicit startup instances
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            initial_workers: default_initial_workers(),
            default_weight: default_weight(),
            default_region: None,
            instances: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Specs for the instances to create at startup
    pub fn startup_instances(&self) -> Vec<InstanceSpec> {
        if !self.instances.is_empty() {
            return self.instances.clone();
        }
        (0..self.initial_workers)
            .map(|_| InstanceSpec {
                weight: self.default_weight,
                region: self.default_region.clone(),
            })
            .collect()
    }
}

/// Shape of one worker instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Capacity weight used by weighted routing
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Region tag used by geographic routing
    #[serde(default)]
    pub region: Option<String>,
}

impl Default for InstanceSpec {
    fn default() -> Self {
        InstanceSpec {
            weight: default_weight(),
            region: None,
        }
    }
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

fn default_initial_workers() -> usize {
    4
}

fn default_weight() -> u32 {
    1
}
