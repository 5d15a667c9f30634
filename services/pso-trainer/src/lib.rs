pub mod workload;

pub use workload::{ackley, AckleyObjective, ReplicatedEvaluator, Simulation, TrainerSettings, WorkloadSettings};
