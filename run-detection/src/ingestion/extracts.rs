//! Instrument specific enrichment of a freshly ingested JobRequest.
//!
//! Every function here is infallible. A value that cannot be read is stored as
//! `null` (or the documented default) and a warning is logged, so a partially
//! populated data file still produces a JobRequest for the rules to judge.
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::container::{Container, Dataset};
use crate::job_request::JobRequest;

pub type ExtractFn = fn(&mut JobRequest, &dyn Container);

static EXTRACTS: &[(&str, ExtractFn)] = &[
    ("mari", mari_extract),
    ("tosca", tosca_extract),
    ("osiris", osiris_and_iris_extract),
    ("iris", osiris_and_iris_extract),
    ("loq", loq_extract),
    ("sans2d", sans2d_extract),
];

static CYCLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cycle_(\d+)_(\d+)").expect("cycle pattern is valid"));

/// The enrichment registered for `instrument`, matched case-insensitively.
pub fn extraction_function(instrument: &str) -> ExtractFn {
    EXTRACTS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(instrument))
        .map(|(_, extract)| *extract)
        .unwrap_or(skip_extract)
}

pub fn skip_extract(job_request: &mut JobRequest, _: &dyn Container) {
    info!(
        instrument = %job_request.instrument,
        run_number = job_request.run_number,
        "no additional extraction needed"
    );
}

/// The `cycle_NN_N` segment of a data file path.
pub fn cycle_string(filepath: &str) -> Option<String> {
    CYCLE_PATTERN
        .find(filepath)
        .map(|found| found.as_str().to_owned())
}

fn set_cycle_string(job_request: &mut JobRequest) {
    let cycle = cycle_string(&job_request.filepath);
    if cycle.is_none() {
        warn!(path = %job_request.filepath, "unable to build a cycle string");
    }
    job_request.set_value("cycle_string", cycle);
}

fn first_float(job_request: &JobRequest, container: &dyn Container, field: &str) -> Value {
    match container.dataset(field).and_then(|d| d.first_float()) {
        Some(value) => json!(value),
        None => {
            warn!(
                instrument = %job_request.instrument,
                run_number = job_request.run_number,
                "missing {}", field
            );
            Value::Null
        }
    }
}

/// First value of a dataset with its native type, for comparing against direct runs.
fn first_value(container: &dyn Container, field: &str) -> Value {
    match container.dataset(field) {
        Some(Dataset::Text(values)) => values.first().map_or(Value::Null, |v| json!(v)),
        Some(Dataset::Int(values)) => values.first().map_or(Value::Null, |v| json!(v)),
        Some(Dataset::Float(values)) => values.first().map_or(Value::Null, |v| json!(v)),
        None => Value::Null,
    }
}

pub fn mari_extract(job_request: &mut JobRequest, container: &dyn Container) {
    let ei = match container.dataset("ei").map(|d| d.floats()) {
        Some(values) if values.len() == 1 => json!(values[0]),
        Some(values) if values.len() > 1 => json!(values),
        _ => json!("'auto'"),
    };
    let sam_mass = container
        .dataset("sam_mass")
        .and_then(|d| d.first_float())
        .unwrap_or(0.0);
    let sam_rmm = container
        .dataset("sam_rmm")
        .and_then(|d| d.first_float())
        .unwrap_or(0.0);
    let remove_bkg = container
        .dataset("remove_bkg")
        .and_then(|d| d.first_bool())
        .unwrap_or(false);
    // A monovanadium normalisation only makes sense with a known sample
    let monovan = if sam_mass != 0.0 && sam_rmm != 0.0 {
        job_request.run_number
    } else {
        0
    };

    job_request.set_value("ei", ei);
    job_request.set_value("sam_mass", sam_mass);
    job_request.set_value("sam_rmm", sam_rmm);
    job_request.set_value("monovan", monovan);
    job_request.set_value("remove_bkg", remove_bkg);
    job_request.set_value("sum_runs", false);
    job_request.set_value("runno", job_request.run_number);
}

pub fn tosca_extract(job_request: &mut JobRequest, _: &dyn Container) {
    set_cycle_string(job_request);
}

pub fn osiris_and_iris_extract(job_request: &mut JobRequest, container: &dyn Container) {
    set_cycle_string(job_request);

    let freq6 = container
        .dataset("selog/freq6/value_log/value")
        .and_then(|d| d.first_float());
    let freq10 = container
        .dataset("selog/freq10/value_log/value")
        .and_then(|d| d.first_float());
    let (freq6, freq10) = match (freq6, freq10) {
        (Some(freq6), Some(freq10)) => reconcile_frequencies(job_request, freq6, freq10),
        _ => {
            warn!(
                instrument = %job_request.instrument,
                run_number = job_request.run_number,
                "missing chopper frequencies"
            );
            (Value::Null, Value::Null)
        }
    };
    job_request.set_value("freq6", freq6);
    job_request.set_value("freq10", freq10);

    let phase6 = first_float(job_request, container, "selog/phase6/value");
    let phase10 = first_float(job_request, container, "selog/phase10/value");
    job_request.set_value("phase6", phase6);
    job_request.set_value("phase10", phase10);

    for (channels, name) in [("time_channels_1", "detector"), ("time_channels_2", "monitor")] {
        let time_of_flight = container
            .dataset(&format!("instrument/dae/{channels}/time_of_flight"))
            .map(|d| d.floats())
            .unwrap_or_default();
        let bounds = time_of_flight.iter().copied().fold(None, |bounds, value| {
            Some(match bounds {
                None => (value, value),
                Some((min, max)) => (f64::min(min, value), f64::max(max, value)),
            })
        });
        let (min, max) = match bounds {
            Some((min, max)) => (json!(min), json!(max)),
            None => {
                warn!(
                    instrument = %job_request.instrument,
                    run_number = job_request.run_number,
                    "missing {} time channel boundaries", name
                );
                (Value::Null, Value::Null)
            }
        };
        job_request.set_value(&format!("tcb_{name}_min"), min);
        job_request.set_value(&format!("tcb_{name}_max"), max);
    }
}

/// Both choppers should spin at the same frequency. Values within 1% of each
/// other are float noise and get rounded; anything further apart is unusable.
fn reconcile_frequencies(job_request: &JobRequest, freq6: f64, freq10: f64) -> (Value, Value) {
    let difference = (freq6 - freq10).abs();
    if difference > freq6.max(freq10) * 0.01 {
        warn!(
            instrument = %job_request.instrument,
            run_number = job_request.run_number,
            freq6, freq10,
            "chopper frequencies are not within 1% of each other"
        );
        return (Value::Null, Value::Null);
    }
    if freq6 != freq10 {
        return (json!(freq6.round()), json!(freq10.round()));
    }
    (json!(freq6), json!(freq10))
}

fn sans_extract(job_request: &mut JobRequest, container: &dyn Container) {
    set_cycle_string(job_request);

    let thickness = first_float(job_request, container, "sample/thickness");
    let geometry = container
        .dataset("sample/shape")
        .and_then(|d| d.first_text())
        .map_or(Value::Null, |shape| json!(shape));
    let height = first_float(job_request, container, "sample/height");
    let width = first_float(job_request, container, "sample/width");

    job_request.set_value("sample_thickness", thickness);
    job_request.set_value("sample_geometry", geometry);
    job_request.set_value("sample_height", height);
    job_request.set_value("sample_width", width);
}

pub fn loq_extract(job_request: &mut JobRequest, container: &dyn Container) {
    let aperture = container
        .keys("selog")
        .unwrap_or_default()
        .into_iter()
        .find(|key| key.contains("Aperture_"));
    let comparison = match aperture {
        Some(key) => {
            let value = first_value(container, &format!("selog/{key}/value"));
            json!({ "selog": { key: value } })
        }
        None => json!({}),
    };
    job_request.set_value("instrument_direct_file_comparison", comparison);

    sans_extract(job_request, container);
}

pub fn sans2d_extract(job_request: &mut JobRequest, container: &dyn Container) {
    let logs = ["Rear_Det_Z", "Front_Det_Z"]
        .into_iter()
        .map(str::to_owned)
        .chain((1..=5).map(|i| format!("G{i}")))
        .chain((1..=6).map(|i| format!("S{i}")))
        .chain(["E", "N", "S", "W"].map(|side| format!("Jaw_{side}")));

    let mut selog = Map::new();
    for log in logs {
        let value = first_value(container, &format!("selog/{log}/value"));
        if value.is_null() {
            warn!(run_number = job_request.run_number, "missing SANS2D log {}", log);
        }
        selog.insert(log, value);
    }
    job_request.set_value("instrument_direct_file_comparison", json!({ "selog": selog }));

    sans_extract(job_request, container);
}
