//! Reverse indices from appointments to jobs and technicians.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fieldops_core::{Appointment, AppointmentAssignment};

/// `job id -> assigned technician ids`, built by following the
/// `appointment id -> job id` reverse index through staffing assignments.
pub struct AssignmentIndex {
    techs_by_job: HashMap<i64, Vec<i64>>,
}

impl AssignmentIndex {
    /// When a job carries assignments on several appointments, the crew of
    /// the appointment with the most recent start wins; the result does not
    /// depend on iteration order. Assignment list order is preserved; the
    /// first slot is the primary technician.
    pub fn build(appointments: &[Appointment], assignments: &[AppointmentAssignment]) -> Self {
        let mut appointment_job: HashMap<i64, (i64, DateTime<Utc>)> = HashMap::new();
        for appointment in appointments {
            appointment_job.insert(appointment.id, (appointment.job_id, appointment.start));
        }

        let mut per_appointment: HashMap<i64, Vec<i64>> = HashMap::new();
        for assignment in assignments {
            let slots = per_appointment.entry(assignment.appointment_id).or_default();
            if !slots.contains(&assignment.technician_id) {
                slots.push(assignment.technician_id);
            }
        }

        let mut chosen: HashMap<i64, (DateTime<Utc>, Vec<i64>)> = HashMap::new();
        for (appointment_id, technicians) in per_appointment {
            let Some(&(job_id, start)) = appointment_job.get(&appointment_id) else {
                continue;
            };
            match chosen.entry(job_id) {
                Entry::Vacant(slot) => {
                    slot.insert((start, technicians));
                }
                Entry::Occupied(mut slot) => {
                    if start > slot.get().0 {
                        slot.insert((start, technicians));
                    }
                }
            }
        }

        Self {
            techs_by_job: chosen
                .into_iter()
                .map(|(job_id, (_, technicians))| (job_id, technicians))
                .collect(),
        }
    }

    pub fn technicians_for(&self, job_id: i64) -> &[i64] {
        self.techs_by_job
            .get(&job_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn appointment(id: i64, job_id: i64, hour: u32) -> Appointment {
        Appointment {
            id,
            job_id,
            start: Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap(),
            end: None,
        }
    }

    fn assignment(appointment_id: i64, technician_id: i64) -> AppointmentAssignment {
        AppointmentAssignment {
            appointment_id,
            technician_id,
            technician_name: None,
        }
    }

    #[test]
    fn maps_technicians_through_the_appointment_index() {
        let index = AssignmentIndex::build(
            &[appointment(10, 1, 9)],
            &[assignment(10, 501), assignment(10, 502), assignment(10, 501)],
        );
        assert_eq!(index.technicians_for(1), &[501, 502]);
        assert!(index.technicians_for(2).is_empty());
    }

    #[test]
    fn most_recent_appointment_crew_wins() {
        let appointments = [appointment(10, 1, 9), appointment(11, 1, 15)];
        let assignments = [assignment(11, 700), assignment(10, 501), assignment(10, 502)];

        // Same data in both orders must give the same answer.
        let forward = AssignmentIndex::build(&appointments, &assignments);
        let mut reversed = assignments.to_vec();
        reversed.reverse();
        let backward = AssignmentIndex::build(&appointments, &reversed);

        assert_eq!(forward.technicians_for(1), &[700]);
        assert_eq!(backward.technicians_for(1), &[700]);
    }

    #[test]
    fn assignments_for_unknown_appointments_are_ignored() {
        let index = AssignmentIndex::build(&[appointment(10, 1, 9)], &[assignment(99, 501)]);
        assert!(index.technicians_for(1).is_empty());
    }
}
