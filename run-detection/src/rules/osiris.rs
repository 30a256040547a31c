//! OSIRIS rules. The phase and time channel tables come from the OSIRIS user
//! guide appendix of quasi/inelastic settings.
use std::collections::BTreeMap;

use crate::error::RuleError;
use crate::job_request::JobRequest;
use crate::rules::{is_y_within_5_percent_of_x, required_number};

/// (phase6, phase10) pairs of spectroscopy settings.
const SPECTROSCOPY_PHASES: [(f64, f64); 10] = [
    (8573.0, 14250.0),
    (6052.0, 11250.0),
    (7500.0, 12500.0),
    (9738.0, 16166.0),
    (8964.0, 15211.0),
    (1500.0, 2805.0),
    (6569.0, 10861.0),
    (8207.0, 13502.0),
    (3717.0, 5675.0),
    (3217.0, 4904.0),
];

/// (phase6, phase10) pairs of diffraction settings.
const DIFFRACTION_PHASES: [(f64, f64); 11] = [
    (1011.0, 1566.0),
    (4599.0, 7715.0),
    (7590.0, 12859.0),
    (10407.0, 17715.0),
    (13015.0, 22800.0),
    (16100.0, 27973.0),
    (19480.0, 33251.0),
    (22571.0, 38130.0),
    (26062.0, 3609.0),
    (28953.0, 8228.0),
    (32144.0, 13367.0),
];

/// Detector time channel bounds that only spectroscopy runs use.
const SPECTROSCOPY_DETECTOR_BOUNDS: [(f64, f64); 2] = [(40200.0, 80200.0), (57300.0, 97300.0)];

/// (detector min, detector max, monitor min, monitor max) to reflection. Frequencies
/// below 50Hz are absent because they always use the 002 reflection.
const REFLECTION_TIME_CHANNELS: [((f64, f64, f64, f64), &str); 7] = [
    ((51500.0, 71500.0, 45900.0, 65900.0), "002"),
    ((45500.0, 65500.0, 40400.0, 60400.0), "002"),
    ((58700.0, 78700.0, 52000.0, 72000.0), "002"),
    ((40500.0, 60500.0, 35300.0, 55300.0), "002"),
    ((48500.0, 68500.0, 43600.0, 63600.0), "002"),
    // The .03 matches the instrument setting
    ((22500.0, 42500.0, 19000.03, 39000.0), "004"),
    ((20500.0, 40500.0, 16700.0, 36700.0), "004"),
];

pub(super) fn default_spectroscopy(set: bool, job_request: &mut JobRequest) -> Result<(), RuleError> {
    if set {
        job_request.set_value("spectroscopy_reduction", "true");
        job_request.set_value("diffraction_reduction", "false");
    }
    Ok(())
}

pub(super) fn default_graphite_analyser(
    set: bool,
    job_request: &mut JobRequest,
) -> Result<(), RuleError> {
    if set {
        job_request.set_value("analyser", "graphite");
    }
    Ok(())
}

fn phases_match(phases: &[(f64, f64)], phase6: f64, phase10: f64) -> bool {
    phases.iter().any(|(spec6, spec10)| {
        is_y_within_5_percent_of_x(phase6, *spec6) && is_y_within_5_percent_of_x(phase10, *spec10)
    })
}

/// Decide between a spectroscopy and a diffraction reduction. Diffraction runs
/// are never summed.
pub(super) fn reduction_mode(set: bool, job_request: &mut JobRequest) -> Result<(), RuleError> {
    const RULE: &str = "osirisReductionMode";
    if !set {
        return Ok(());
    }

    let freq10 = required_number(job_request, RULE, "freq10")?;
    let mode = if freq10.round() != 25.0 {
        "spectroscopy"
    } else {
        let phase6 = required_number(job_request, RULE, "phase6")?;
        let phase10 = required_number(job_request, RULE, "phase10")?;
        let diffraction = phases_match(&DIFFRACTION_PHASES, phase6, phase10);
        let spectroscopy = phases_match(&SPECTROSCOPY_PHASES, phase6, phase10);

        match (diffraction, spectroscopy) {
            (true, true) => {
                // Only the detector time channels tell the two apart
                let tcb_min = required_number(job_request, RULE, "tcb_detector_min")?;
                let tcb_max = required_number(job_request, RULE, "tcb_detector_max")?;
                let spectroscopy_bounds =
                    SPECTROSCOPY_DETECTOR_BOUNDS.iter().any(|(min, max)| {
                        is_y_within_5_percent_of_x(tcb_min, *min)
                            && is_y_within_5_percent_of_x(tcb_max, *max)
                    });
                if spectroscopy_bounds {
                    "spectroscopy"
                } else {
                    "diffraction"
                }
            }
            (true, false) => "diffraction",
            (false, true) => "spectroscopy",
            (false, false) => {
                return Err(RuleError::RuleViolation {
                    rule: RULE,
                    reason: "phases match neither diffraction nor spectroscopy".to_owned(),
                })
            }
        }
    };

    if mode == "diffraction" {
        job_request.set_value("sum_runs", false);
        job_request.additional_requests.clear();
    }
    job_request.set_value("mode", mode);
    Ok(())
}

/// Pick the analyser reflection of the run and the calibration run that goes with it.
pub(super) fn reflection_calibration(
    calibration: &BTreeMap<String, String>,
    job_request: &mut JobRequest,
) -> Result<(), RuleError> {
    const RULE: &str = "osirisCalibFilesAndReflection";
    if calibration.is_empty() {
        return Ok(());
    }

    let reflection = if required_number(job_request, RULE, "freq10")?.round() < 50.0 {
        "002"
    } else {
        let detector_min = required_number(job_request, RULE, "tcb_detector_min")?;
        let detector_max = required_number(job_request, RULE, "tcb_detector_max")?;
        let monitor_min = required_number(job_request, RULE, "tcb_monitor_min")?;
        let monitor_max = required_number(job_request, RULE, "tcb_monitor_max")?;

        REFLECTION_TIME_CHANNELS
            .iter()
            .find(|((d_min, d_max, m_min, m_max), _)| {
                is_y_within_5_percent_of_x(detector_min, *d_min)
                    && is_y_within_5_percent_of_x(detector_max, *d_max)
                    && is_y_within_5_percent_of_x(monitor_min, *m_min)
                    && is_y_within_5_percent_of_x(monitor_max, *m_max)
            })
            .map(|(_, reflection)| *reflection)
            .ok_or_else(|| RuleError::RuleViolation {
                rule: RULE,
                reason: "analyser reflection cannot be determined".to_owned(),
            })?
    };

    let calibration_run = calibration
        .get(reflection)
        .ok_or_else(|| RuleError::RuleViolation {
            rule: RULE,
            reason: format!("no calibration run for reflection {reflection}"),
        })?;

    job_request.set_value("reflection", reflection);
    job_request.set_value("calibration_run_number", calibration_run.as_str());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn osiris(values: Value) -> JobRequest {
        let Value::Object(additional_values) = values else {
            panic!("not an object")
        };
        JobRequest {
            instrument: "OSIRIS".to_owned(),
            additional_values,
            ..JobRequest::default()
        }
    }

    fn calibration() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("002".to_owned(), "00148587".to_owned()),
            ("004".to_owned(), "00148588".to_owned()),
        ])
    }

    #[test]
    fn test_defaults() {
        let mut job = osiris(json!({}));
        default_spectroscopy(true, &mut job).unwrap();
        default_graphite_analyser(true, &mut job).unwrap();
        assert_eq!(job.additional_values["spectroscopy_reduction"], json!("true"));
        assert_eq!(job.additional_values["diffraction_reduction"], json!("false"));
        assert_eq!(job.additional_values["analyser"], json!("graphite"));

        let mut untouched = osiris(json!({}));
        default_spectroscopy(false, &mut untouched).unwrap();
        default_graphite_analyser(false, &mut untouched).unwrap();
        assert!(untouched.additional_values.is_empty());
    }

    #[test]
    fn test_low_frequency_is_002() {
        let mut job = osiris(json!({"freq10": 25.0}));

        reflection_calibration(&calibration(), &mut job).unwrap();

        assert_eq!(job.additional_values["reflection"], json!("002"));
        assert_eq!(job.additional_values["calibration_run_number"], json!("00148587"));
    }

    #[test]
    fn test_reflection_from_time_channels() {
        let mut job = osiris(json!({
            "freq10": 50.0,
            "tcb_detector_min": 22600.0,
            "tcb_detector_max": 42400.0,
            "tcb_monitor_min": 19000.0,
            "tcb_monitor_max": 39100.0
        }));

        reflection_calibration(&calibration(), &mut job).unwrap();

        assert_eq!(job.additional_values["reflection"], json!("004"));
        assert_eq!(job.additional_values["calibration_run_number"], json!("00148588"));
    }

    #[test]
    fn test_unmatched_time_channels_violate() {
        let mut job = osiris(json!({
            "freq10": 50.0,
            "tcb_detector_min": 1.0,
            "tcb_detector_max": 2.0,
            "tcb_monitor_min": 3.0,
            "tcb_monitor_max": 4.0
        }));

        let error = reflection_calibration(&calibration(), &mut job).unwrap_err();
        assert!(matches!(error, RuleError::RuleViolation { .. }));

        let mut no_frequency = osiris(json!({"freq10": null}));
        assert!(reflection_calibration(&calibration(), &mut no_frequency).is_err());
    }

    #[test]
    fn test_reduction_mode() {
        let mut not_25hz = osiris(json!({"freq10": 50.0}));
        reduction_mode(true, &mut not_25hz).unwrap();
        assert_eq!(not_25hz.additional_values["mode"], json!("spectroscopy"));

        let mut diffraction = osiris(json!({
            "freq10": 25.0, "phase6": 1011.0, "phase10": 1566.0
        }));
        diffraction.additional_requests.push(osiris(json!({})));
        reduction_mode(true, &mut diffraction).unwrap();
        assert_eq!(diffraction.additional_values["mode"], json!("diffraction"));
        assert_eq!(diffraction.additional_values["sum_runs"], json!(false));
        assert!(diffraction.additional_requests.is_empty());

        // (7500, 12500) is a spectroscopy setting within 5% of diffraction (7590, 12859)
        let mut ambiguous = osiris(json!({
            "freq10": 25.0, "phase6": 7500.0, "phase10": 12500.0,
            "tcb_detector_min": 40200.0, "tcb_detector_max": 80200.0
        }));
        reduction_mode(true, &mut ambiguous).unwrap();
        assert_eq!(ambiguous.additional_values["mode"], json!("spectroscopy"));

        let mut neither = osiris(json!({
            "freq10": 25.0, "phase6": 100.0, "phase10": 100.0
        }));
        assert!(reduction_mode(true, &mut neither).is_err());
    }
}
