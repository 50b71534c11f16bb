//! Keyed merging of overlapping fetch windows.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use fieldops_core::Appointment;

/// Which collection keeps its record when both contain the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    PreferFirst,
    PreferSecond,
}

/// Two-pass keyed merge with the collision winner as a visible parameter.
///
/// Output iterates in ascending key order, so downstream processing is
/// deterministic regardless of upstream response ordering.
pub fn merge_by_key<T, K, F>(first: Vec<T>, second: Vec<T>, key: F, precedence: Precedence) -> Vec<T>
where
    K: Ord + Copy,
    F: Fn(&T) -> K,
{
    let mut merged: BTreeMap<K, T> = BTreeMap::new();
    for item in first {
        merged.insert(key(&item), item);
    }
    for item in second {
        match precedence {
            Precedence::PreferSecond => {
                merged.insert(key(&item), item);
            }
            Precedence::PreferFirst => {
                merged.entry(key(&item)).or_insert(item);
            }
        }
    }
    merged.into_values().collect()
}

/// One appointment per job for a single fetch window: the earliest-starting
/// one represents the job (its next visit, for the upcoming window).
pub fn window_representatives(appointments: &[Appointment]) -> Vec<Appointment> {
    let mut by_job: BTreeMap<i64, Appointment> = BTreeMap::new();
    for appointment in appointments {
        match by_job.entry(appointment.job_id) {
            Entry::Vacant(slot) => {
                slot.insert(appointment.clone());
            }
            Entry::Occupied(mut slot) => {
                if appointment.start < slot.get().start {
                    slot.insert(appointment.clone());
                }
            }
        }
    }
    by_job.into_values().collect()
}
