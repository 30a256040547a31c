use std::collections::BTreeMap;

use crate::error::RuleError;
use crate::job_request::JobRequest;
use crate::rules::{is_y_within_5_percent_of_x, required_number};

struct GraphiteSetting {
    phases: (f64, f64),
    reflection: &'static str,
    detector_bounds: (f64, f64),
    monitor_bounds: (f64, f64),
}

const fn setting(
    phases: (f64, f64),
    reflection: &'static str,
    detector_bounds: (f64, f64),
    monitor_bounds: (f64, f64),
) -> GraphiteSetting {
    GraphiteSetting {
        phases,
        reflection,
        detector_bounds,
        monitor_bounds,
    }
}

// Graphite analyser settings from the IRIS user guide
const GRAPHITE_SETTINGS: [GraphiteSetting; 14] = [
    setting((8967.0, 14413.0), "002", (56000.0, 76000.0), (52200.0, 72200.0)),
    setting((7996.0, 12868.0), "002", (50000.0, 70000.0), (46700.0, 66700.0)),
    setting((7649.0, 12316.0), "002", (48000.0, 68000.0), (44700.0, 64700.0)),
    setting((7336.0, 11967.0), "002", (47000.0, 67000.0), (43200.0, 63200.0)),
    setting((5922.0, 9569.0), "002", (38000.0, 58000.0), (35200.0, 55200.0)),
    setting((7133.0, 11493.0), "002", (45000.0, 65000.0), (41900.0, 61900.0)),
    setting((1500.0, 2829.0), "002", (14000.0, 74000.0), (16000.0, 76000.0)),
    setting((2655.0, 5148.0), "002", (22000.0, 82000.0), (21500.0, 81500.0)),
    setting((7750.0, 12623.0), "002", (50000.0, 90000.0), (46500.0, 86500.0)),
    setting((5919.0, 9712.0), "002", (38500.0, 78500.0), (36500.0, 76500.0)),
    setting((4502.0, 7457.0), "002", (30000.0, 70000.0), (28800.0, 68800.0)),
    setting((3500.0, 5800.0), "002", (25000.0, 65000.0), (23500.0, 63500.0)),
    setting((3653.0, 5959.0), "004", (24000.0, 44000.0), (22700.0, 42700.0)),
    setting((2850.0, 4275.0), "004", (18000.0, 38000.0), (17500.0, 37500.0)),
];

fn pair_matches(actual: (f64, f64), expected: (f64, f64)) -> bool {
    is_y_within_5_percent_of_x(actual.0, expected.0) && is_y_within_5_percent_of_x(actual.1, expected.1)
}

/// Work out the reflection of a graphite analyser run. Anything below 50Hz, and
/// anything that matches no known setting, is the 002 reflection.
pub(super) fn reduction(set: bool, job_request: &mut JobRequest) -> Result<(), RuleError> {
    const RULE: &str = "irisReduction";
    if !set {
        return Ok(());
    }

    let reflection = if required_number(job_request, RULE, "freq10")?.round() < 50.0 {
        "002"
    } else {
        let phases = (
            required_number(job_request, RULE, "phase6")?,
            required_number(job_request, RULE, "phase10")?,
        );
        let detector = (
            required_number(job_request, RULE, "tcb_detector_min")?,
            required_number(job_request, RULE, "tcb_detector_max")?,
        );
        let monitor = (
            required_number(job_request, RULE, "tcb_monitor_min")?,
            required_number(job_request, RULE, "tcb_monitor_max")?,
        );

        GRAPHITE_SETTINGS
            .iter()
            .find(|setting| {
                pair_matches(phases, setting.phases)
                    && pair_matches(detector, setting.detector_bounds)
                    && pair_matches(monitor, setting.monitor_bounds)
            })
            .map_or("002", |setting| setting.reflection)
    };

    job_request.set_value("reflection", reflection);
    job_request.set_value("analyser", "graphite");
    Ok(())
}

/// Calibration runs per reflection. Needs `irisReduction` earlier in the specification.
pub(super) fn calibration(
    calibration: &BTreeMap<String, String>,
    job_request: &mut JobRequest,
) -> Result<(), RuleError> {
    const RULE: &str = "irisCalibration";
    if calibration.is_empty() {
        return Ok(());
    }

    let reflection = job_request
        .additional_values
        .get("reflection")
        .and_then(|reflection| reflection.as_str())
        .ok_or_else(|| RuleError::RuleViolation {
            rule: RULE,
            reason: "reflection has not been determined".to_owned(),
        })?;
    let calibration_runs = calibration
        .get(reflection)
        .ok_or_else(|| RuleError::RuleViolation {
            rule: RULE,
            reason: format!("no calibration run for reflection {reflection}"),
        })?
        .clone();

    job_request.set_value("calibration_run_numbers", calibration_runs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn iris(values: Value) -> JobRequest {
        let Value::Object(additional_values) = values else {
            panic!("not an object")
        };
        JobRequest {
            instrument: "IRIS".to_owned(),
            additional_values,
            ..JobRequest::default()
        }
    }

    #[test]
    fn test_low_frequency() {
        let mut job = iris(json!({"freq10": 25.0}));

        reduction(true, &mut job).unwrap();

        assert_eq!(job.additional_values["reflection"], json!("002"));
        assert_eq!(job.additional_values["analyser"], json!("graphite"));
    }

    #[test]
    fn test_004_setting() {
        let mut job = iris(json!({
            "freq10": 50.0,
            "phase6": 3653.0,
            "phase10": 5959.0,
            "tcb_detector_min": 24000.0,
            "tcb_detector_max": 44000.0,
            "tcb_monitor_min": 22700.0,
            "tcb_monitor_max": 42700.0
        }));

        reduction(true, &mut job).unwrap();
        calibration(
            &BTreeMap::from([
                ("002".to_owned(), "00105275".to_owned()),
                ("004".to_owned(), "00105276".to_owned()),
            ]),
            &mut job,
        )
        .unwrap();

        assert_eq!(job.additional_values["reflection"], json!("004"));
        assert_eq!(job.additional_values["calibration_run_numbers"], json!("00105276"));
    }

    #[test]
    fn test_unknown_setting_defaults_to_002() {
        let mut job = iris(json!({
            "freq10": 50.0,
            "phase6": 1.0,
            "phase10": 1.0,
            "tcb_detector_min": 1.0,
            "tcb_detector_max": 1.0,
            "tcb_monitor_min": 1.0,
            "tcb_monitor_max": 1.0
        }));

        reduction(true, &mut job).unwrap();

        assert_eq!(job.additional_values["reflection"], json!("002"));
    }

    #[test]
    fn test_calibration_needs_reflection() {
        let mut job = iris(json!({}));
        let calibrations = BTreeMap::from([("002".to_owned(), "00105275".to_owned())]);

        let error = calibration(&calibrations, &mut job).unwrap_err();

        assert!(matches!(error, RuleError::RuleViolation { rule: "irisCalibration", .. }));
    }
}
