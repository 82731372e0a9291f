//! Process-wide registry of running conveyor instances.
//!
//! Populated at start, drained at stop. Lookups are concurrent reads;
//! writes only happen on registration, so a sharded map is plenty.

use std::sync::OnceLock;

use dashmap::DashMap;

use crate::instance::Conveyor;

fn instances() -> &'static DashMap<String, Conveyor> {
    static INSTANCES: OnceLock<DashMap<String, Conveyor>> = OnceLock::new();
    INSTANCES.get_or_init(DashMap::new)
}

/// Register an instance under its name, replacing any previous holder.
pub fn register(instance: Conveyor) {
    instances().insert(instance.name().to_owned(), instance);
}

/// Look an instance up by name.
pub fn get(name: &str) -> Option<Conveyor> {
    instances().get(name).map(|entry| entry.value().clone())
}

/// Remove an instance at shutdown.
pub fn unregister(name: &str) -> Option<Conveyor> {
    instances().remove(name).map(|(_, instance)| instance)
}
