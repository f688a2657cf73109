use serde::{Deserialize, Serialize};

/// The category tag attached to an RPC that selects which named throttler
/// to charge (spec.md §5, "Throttling"; GLOSSARY "Workload descriptor").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadDescriptor {
    User,
    Replication,
    Repair,
    TabletLogging,
}

impl WorkloadDescriptor {
    pub fn throttler_name(self) -> &'static str {
        match self {
            WorkloadDescriptor::User => "user",
            WorkloadDescriptor::Replication => "replication",
            WorkloadDescriptor::Repair => "repair",
            WorkloadDescriptor::TabletLogging => "tablet-logging",
        }
    }
}
