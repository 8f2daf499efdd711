use serde::{Deserialize, Serialize};

/// A software environment in which actions can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub executables: Vec<Executable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executable {
    pub label: String,
    #[serde(default)]
    pub instances: Vec<ExecutableInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_mode: Option<String>,
    #[serde(default)]
    pub num_cores: NumCores,
    pub command: String,
}

/// Inclusive range of core counts an executable instance supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumCores {
    pub start: u32,
    pub stop: u32,
    #[serde(default = "one")]
    pub step: u32,
}

fn one() -> u32 {
    1
}

impl Default for NumCores {
    fn default() -> Self {
        Self {
            start: 1,
            stop: 1,
            step: 1,
        }
    }
}

impl NumCores {
    pub fn contains(&self, n: u32) -> bool {
        n >= self.start && n <= self.stop && (n - self.start) % self.step.max(1) == 0
    }
}

impl Environment {
    pub fn executable(&self, label: &str) -> Option<&Executable> {
        self.executables.iter().find(|e| e.label == label)
    }
}

impl Executable {
    /// Find an instance able to run with `num_cores`, in `parallel_mode` if one is requested.
    pub fn instance(&self, num_cores: u32, parallel_mode: Option<&str>) -> Option<&ExecutableInstance> {
        self.instances.iter().find(|inst| {
            inst.num_cores.contains(num_cores)
                && parallel_mode.map_or(true, |mode| inst.parallel_mode.as_deref() == Some(mode))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_cores_range_is_inclusive_and_stepped() {
        let range = NumCores {
            start: 2,
            stop: 8,
            step: 2,
        };
        assert!(range.contains(2));
        assert!(range.contains(8));
        assert!(!range.contains(5));
        assert!(!range.contains(10));
    }

    #[test]
    fn instance_respects_parallel_mode() {
        let exe = Executable {
            label: "python".to_owned(),
            instances: vec![ExecutableInstance {
                parallel_mode: Some("mpi".to_owned()),
                num_cores: NumCores {
                    start: 1,
                    stop: 16,
                    step: 1,
                },
                command: "mpirun python".to_owned(),
            }],
        };
        assert!(exe.instance(4, Some("mpi")).is_some());
        assert!(exe.instance(4, Some("openmp")).is_none());
        assert!(exe.instance(4, None).is_some());
        assert!(exe.instance(32, None).is_none());
    }
}
