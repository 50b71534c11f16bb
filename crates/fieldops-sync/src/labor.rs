//! Two-tier labor metrics: timesheet-based, with an appointment-window
//! fallback when no paid-duration data exists.

use std::collections::{BTreeMap, HashMap};

use fieldops_core::{Appointment, TimesheetEntry};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaborMetrics {
    pub labor_hours: Option<f64>,
    pub labor_cost: Option<f64>,
    pub technician_count: Option<i32>,
    pub primary_technician_id: Option<i64>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round_to_quarter_hour(hours: f64) -> f64 {
    (hours * 4.0).round() / 4.0
}

/// Tier 1 uses paid timesheet durations and ignores any appointment data for
/// the same job. Tier 2 estimates from the appointment window and is entered
/// only when the job has zero timesheet entries. With neither source, all
/// derived fields stay null.
pub fn compute_labor_metrics(
    entries: &[TimesheetEntry],
    appointment: Option<&Appointment>,
    assigned: &[i64],
    rates: &HashMap<i64, f64>,
) -> LaborMetrics {
    let primary_technician_id = assigned
        .first()
        .copied()
        .or_else(|| entries.first().map(|entry| entry.employee_id));

    if !entries.is_empty() {
        let total: f64 = entries.iter().map(|entry| entry.paid_duration_hours).sum();
        let mut per_employee: BTreeMap<i64, f64> = BTreeMap::new();
        for entry in entries {
            *per_employee.entry(entry.employee_id).or_default() += entry.paid_duration_hours;
        }
        // Employees without a known rate contribute hours but never cost; a
        // zero sum means "unknown", not "free".
        let cost: f64 = per_employee
            .iter()
            .filter_map(|(employee, hours)| rates.get(employee).map(|rate| hours * rate))
            .sum();
        return LaborMetrics {
            labor_hours: Some(round2(total)),
            labor_cost: (cost > 0.0).then(|| round2(cost)),
            technician_count: Some(per_employee.len() as i32),
            primary_technician_id,
        };
    }

    if let Some(appointment) = appointment {
        if let Some(end) = appointment.end {
            let minutes = (end - appointment.start).num_minutes();
            let raw = round_to_quarter_hour(minutes as f64 / 60.0);
            if raw > 0.0 {
                if assigned.is_empty() {
                    return LaborMetrics {
                        labor_hours: Some(raw),
                        labor_cost: None,
                        technician_count: None,
                        primary_technician_id,
                    };
                }
                // All-or-nothing: a partially rated crew yields no cost.
                let cost = assigned
                    .iter()
                    .all(|technician| rates.contains_key(technician))
                    .then(|| {
                        round2(raw * assigned.iter().map(|technician| rates[technician]).sum::<f64>())
                    });
                return LaborMetrics {
                    labor_hours: Some(round2(raw * assigned.len() as f64)),
                    labor_cost: cost,
                    technician_count: Some(assigned.len() as i32),
                    primary_technician_id,
                };
            }
        }
    }

    LaborMetrics {
        labor_hours: None,
        labor_cost: None,
        technician_count: None,
        primary_technician_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(employee_id: i64, hours: f64) -> TimesheetEntry {
        TimesheetEntry {
            job_id: 1,
            employee_id,
            paid_duration_hours: hours,
        }
    }

    fn appointment(start_hour: u32, start_min: u32, end_hour: u32, end_min: u32) -> Appointment {
        Appointment {
            id: 10,
            job_id: 1,
            start: Utc
                .with_ymd_and_hms(2026, 3, 2, start_hour, start_min, 0)
                .single()
                .unwrap(),
            end: Some(
                Utc.with_ymd_and_hms(2026, 3, 2, end_hour, end_min, 0)
                    .single()
                    .unwrap(),
            ),
        }
    }

    #[test]
    fn timesheet_tier_sums_hours_and_costs_only_rated_employees() {
        // 4.5h + 2h for employee 1 at $50/hr, 1h for employee 2 with no rate.
        let entries = [entry(1, 4.5), entry(1, 2.0), entry(2, 1.0)];
        let rates = HashMap::from([(1, 50.0)]);

        let metrics = compute_labor_metrics(&entries, None, &[], &rates);

        assert_eq!(metrics.labor_hours, Some(7.5));
        assert_eq!(metrics.technician_count, Some(2));
        assert_eq!(metrics.labor_cost, Some(325.0));
        assert_eq!(metrics.primary_technician_id, Some(1));
    }

    #[test]
    fn timesheet_tier_ignores_appointment_data() {
        let entries = [entry(1, 2.0)];
        let appt = appointment(9, 0, 17, 0);
        let rates = HashMap::from([(1, 40.0), (9, 40.0)]);

        let metrics = compute_labor_metrics(&entries, Some(&appt), &[9], &rates);

        assert_eq!(metrics.labor_hours, Some(2.0));
        assert_eq!(metrics.technician_count, Some(1));
        assert_eq!(metrics.labor_cost, Some(80.0));
        // staffing assignment still names the primary technician
        assert_eq!(metrics.primary_technician_id, Some(9));
    }

    #[test]
    fn unknown_rates_leave_cost_null_not_zero() {
        let entries = [entry(1, 3.0)];
        let metrics = compute_labor_metrics(&entries, None, &[], &HashMap::new());
        assert_eq!(metrics.labor_hours, Some(3.0));
        assert_eq!(metrics.labor_cost, None);
    }

    #[test]
    fn appointment_tier_multiplies_quarter_rounded_hours_by_crew_size() {
        // 97 minutes ≈ 1.62h, quarter-rounds to 1.5h.
        let appt = appointment(10, 0, 11, 37);
        let rates = HashMap::from([(5, 40.0), (6, 60.0)]);

        let metrics = compute_labor_metrics(&[], Some(&appt), &[5, 6], &rates);

        assert_eq!(metrics.labor_hours, Some(3.0));
        assert_eq!(metrics.technician_count, Some(2));
        assert_eq!(metrics.labor_cost, Some(150.0));
        assert_eq!(metrics.primary_technician_id, Some(5));
    }

    #[test]
    fn appointment_tier_cost_is_all_or_nothing() {
        let appt = appointment(10, 0, 12, 0);
        let rates = HashMap::from([(5, 40.0)]);

        let metrics = compute_labor_metrics(&[], Some(&appt), &[5, 6], &rates);

        assert_eq!(metrics.labor_hours, Some(4.0));
        assert_eq!(metrics.technician_count, Some(2));
        assert_eq!(metrics.labor_cost, None);
    }

    #[test]
    fn appointment_tier_without_crew_reports_raw_hours_only() {
        let appt = appointment(10, 0, 11, 30);
        let metrics = compute_labor_metrics(&[], Some(&appt), &[], &HashMap::new());

        assert_eq!(metrics.labor_hours, Some(1.5));
        assert_eq!(metrics.technician_count, None);
        assert_eq!(metrics.labor_cost, None);
    }

    #[test]
    fn no_data_leaves_all_fields_null() {
        let metrics = compute_labor_metrics(&[], None, &[], &HashMap::new());
        assert_eq!(metrics, LaborMetrics::default());
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round2(325.004), 325.0);
        assert_eq!(round2(7.499), 7.5);
        assert_eq!(round_to_quarter_hour(1.62), 1.5);
        assert_eq!(round_to_quarter_hour(1.88), 2.0);
        assert_eq!(round_to_quarter_hour(0.12), 0.0);
    }
}
