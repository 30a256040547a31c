//! Construction of rules from specification entries.
//!
//! The key to constructor mapping is the static table [`RULES`]. Keys match
//! case-insensitively; values must have exactly the shape the rule expects.
use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::RuleError;
use crate::rules::Rule;

pub type RuleConstructor = fn(&str, &Value) -> Result<Rule, RuleError>;

pub static RULES: &[(&str, RuleConstructor)] = &[
    ("enabled", enabled),
    ("skipTitlesIncluding", skip_titles_including),
    ("allowedInstruments", allowed_instruments),
    ("checkIfScatterSANS", check_if_scatter_sans),
    ("mariMaskFile", mari_mask_file),
    ("mariWBVAN", mari_wbvan),
    ("loqUserFile", loq_user_file),
    ("osirisDefaultSpectroscopy", osiris_default_spectroscopy),
    ("osirisDefaultGraniteAnalyser", osiris_default_granite_analyser),
    ("osirisReductionMode", osiris_reduction_mode),
    ("osirisCalibFilesAndReflection", osiris_calib_files_and_reflection),
    ("irisReduction", iris_reduction),
    ("irisCalibration", iris_calibration),
    ("mariStitch", mari_stitch),
    ("toscaStitch", tosca_stitch),
    ("osirisStitch", osiris_stitch),
];

/// Build the rule registered under `key`.
///
/// An unregistered key is [`RuleError::UnknownRule`], a registered key with a value of
/// the wrong shape is [`RuleError::RuleValue`]. Neither is ever treated as "no rule".
pub fn rule_factory(key: &str, value: &Value) -> Result<Rule, RuleError> {
    let (_, build) = RULES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .ok_or_else(|| RuleError::UnknownRule(key.to_owned()))?;
    build(key, value)
}

fn enabled(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::Enabled)
}

fn skip_titles_including(key: &str, value: &Value) -> Result<Rule, RuleError> {
    strings(key, value).map(Rule::SkipTitlesIncluding)
}

fn allowed_instruments(key: &str, value: &Value) -> Result<Rule, RuleError> {
    strings(key, value).map(Rule::AllowedInstruments)
}

fn check_if_scatter_sans(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::CheckIfScatterSans)
}

fn mari_mask_file(key: &str, value: &Value) -> Result<Rule, RuleError> {
    string(key, value).map(Rule::MariMaskFile)
}

fn mari_wbvan(key: &str, value: &Value) -> Result<Rule, RuleError> {
    integer(key, value).map(Rule::MariWbvan)
}

fn loq_user_file(key: &str, value: &Value) -> Result<Rule, RuleError> {
    string(key, value).map(Rule::LoqUserFile)
}

fn osiris_default_spectroscopy(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::OsirisDefaultSpectroscopy)
}

fn osiris_default_granite_analyser(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::OsirisDefaultGraniteAnalyser)
}

fn osiris_reduction_mode(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::OsirisReductionMode)
}

fn osiris_calib_files_and_reflection(key: &str, value: &Value) -> Result<Rule, RuleError> {
    string_map(key, value).map(Rule::OsirisCalibFilesAndReflection)
}

fn iris_reduction(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::IrisReduction)
}

fn iris_calibration(key: &str, value: &Value) -> Result<Rule, RuleError> {
    string_map(key, value).map(Rule::IrisCalibration)
}

fn mari_stitch(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::MariStitch)
}

fn tosca_stitch(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::ToscaStitch)
}

fn osiris_stitch(key: &str, value: &Value) -> Result<Rule, RuleError> {
    boolean(key, value).map(Rule::OsirisStitch)
}

fn bad_value(key: &str, value: &Value) -> RuleError {
    RuleError::RuleValue {
        key: key.to_owned(),
        value: value.clone(),
    }
}

fn boolean(key: &str, value: &Value) -> Result<bool, RuleError> {
    value.as_bool().ok_or_else(|| bad_value(key, value))
}

fn string(key: &str, value: &Value) -> Result<String, RuleError> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| bad_value(key, value))
}

fn integer(key: &str, value: &Value) -> Result<i64, RuleError> {
    value.as_i64().ok_or_else(|| bad_value(key, value))
}

fn strings(key: &str, value: &Value) -> Result<Vec<String>, RuleError> {
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| bad_value(key, value))
}

fn string_map(key: &str, value: &Value) -> Result<BTreeMap<String, String>, RuleError> {
    value
        .as_object()
        .and_then(|entries| {
            entries
                .iter()
                .map(|(k, v)| Some((k.clone(), v.as_str()?.to_owned())))
                .collect::<Option<BTreeMap<_, _>>>()
        })
        .ok_or_else(|| bad_value(key, value))
}
