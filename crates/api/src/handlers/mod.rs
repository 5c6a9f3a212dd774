pub mod trigger_instances;
pub mod workflows;
