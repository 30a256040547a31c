use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::info;

use crate::container::ContainerOpener;
use crate::error::RuleError;
use crate::job_request::JobRequest;

mod common;
pub mod factory;
mod iris;
mod loq;
mod mari;
mod osiris;
mod stitch;

pub use common::is_y_within_5_percent_of_x;
pub use factory::rule_factory;

/// One entry of an instrument specification.
///
/// Each variant gates the run, enriches its additional values, or both. New
/// kinds of rule are added as a variant plus a row in [`factory::RULES`].
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Enabled(bool),
    SkipTitlesIncluding(Vec<String>),
    AllowedInstruments(Vec<String>),
    CheckIfScatterSans(bool),
    MariMaskFile(String),
    MariWbvan(i64),
    LoqUserFile(String),
    OsirisDefaultSpectroscopy(bool),
    OsirisDefaultGraniteAnalyser(bool),
    OsirisReductionMode(bool),
    OsirisCalibFilesAndReflection(BTreeMap<String, String>),
    IrisReduction(bool),
    IrisCalibration(BTreeMap<String, String>),
    MariStitch(bool),
    ToscaStitch(bool),
    OsirisStitch(bool),
}

impl Rule {
    pub fn name(&self) -> &'static str {
        match self {
            Rule::Enabled(_) => "enabled",
            Rule::SkipTitlesIncluding(_) => "skipTitlesIncluding",
            Rule::AllowedInstruments(_) => "allowedInstruments",
            Rule::CheckIfScatterSans(_) => "checkIfScatterSANS",
            Rule::MariMaskFile(_) => "mariMaskFile",
            Rule::MariWbvan(_) => "mariWBVAN",
            Rule::LoqUserFile(_) => "loqUserFile",
            Rule::OsirisDefaultSpectroscopy(_) => "osirisDefaultSpectroscopy",
            Rule::OsirisDefaultGraniteAnalyser(_) => "osirisDefaultGraniteAnalyser",
            Rule::OsirisReductionMode(_) => "osirisReductionMode",
            Rule::OsirisCalibFilesAndReflection(_) => "osirisCalibFilesAndReflection",
            Rule::IrisReduction(_) => "irisReduction",
            Rule::IrisCalibration(_) => "irisCalibration",
            Rule::MariStitch(_) => "mariStitch",
            Rule::ToscaStitch(_) => "toscaStitch",
            Rule::OsirisStitch(_) => "osirisStitch",
        }
    }

    /// Stitch rules copy the request as the other rules left it, so they run after them.
    pub fn runs_last(&self) -> bool {
        matches!(
            self,
            Rule::MariStitch(_) | Rule::ToscaStitch(_) | Rule::OsirisStitch(_)
        )
    }

    /// Apply the rule. `opener` reads the data files of earlier runs, which only the
    /// stitch rules do.
    pub fn verify(
        &self,
        job_request: &mut JobRequest,
        opener: &dyn ContainerOpener,
    ) -> Result<(), RuleError> {
        match self {
            Rule::Enabled(enabled) => common::enabled(*enabled, job_request),
            Rule::SkipTitlesIncluding(titles) => common::skip_titles_including(titles, job_request),
            Rule::AllowedInstruments(allowed) => common::allowed_instruments(allowed, job_request),
            Rule::CheckIfScatterSans(check) => common::check_if_scatter_sans(*check, job_request),
            Rule::MariMaskFile(link) => mari::mask_file(link, job_request),
            Rule::MariWbvan(wbvan) => mari::wbvan(*wbvan, job_request),
            Rule::LoqUserFile(user_file) => loq::user_file(user_file, job_request),
            Rule::OsirisDefaultSpectroscopy(set) => osiris::default_spectroscopy(*set, job_request),
            Rule::OsirisDefaultGraniteAnalyser(set) => {
                osiris::default_graphite_analyser(*set, job_request)
            }
            Rule::OsirisReductionMode(set) => osiris::reduction_mode(*set, job_request),
            Rule::OsirisCalibFilesAndReflection(calibration) => {
                osiris::reflection_calibration(calibration, job_request)
            }
            Rule::IrisReduction(set) => iris::reduction(*set, job_request),
            Rule::IrisCalibration(calibration) => iris::calibration(calibration, job_request),
            Rule::MariStitch(set) => stitch::mari(*set, job_request, opener),
            Rule::ToscaStitch(set) => stitch::tosca(*set, job_request, opener),
            Rule::OsirisStitch(set) => stitch::molecular_spectroscopy(*set, job_request, opener),
        }
    }
}

/// The ordered rules of one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Specification {
    rules: Vec<Rule>,
}

impl Default for Specification {
    /// What an instrument without a specification document gets: reduce everything.
    fn default() -> Self {
        Self {
            rules: vec![Rule::Enabled(true)],
        }
    }
}

impl Specification {
    /// Build every rule of `document`, in document order except that stitch rules go
    /// last. The first key that does not build fails the whole specification.
    pub fn from_document(document: &Map<String, Value>) -> Result<Self, RuleError> {
        let mut rules = document
            .iter()
            .map(|(key, value)| rule_factory(key, value))
            .collect::<Result<Vec<_>, _>>()?;
        rules.sort_by_key(Rule::runs_last);
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Apply every rule in order. Once a rule clears `will_reduce` no later rule can set
    /// it again, whatever that rule does to the request.
    pub fn verify(
        &self,
        job_request: &mut JobRequest,
        opener: &dyn ContainerOpener,
    ) -> Result<(), RuleError> {
        for rule in &self.rules {
            let will_reduce = job_request.will_reduce;
            rule.verify(job_request, opener)?;
            job_request.will_reduce &= will_reduce;

            if will_reduce && !job_request.will_reduce {
                info!(
                    instrument = %job_request.instrument,
                    run_number = job_request.run_number,
                    rule = rule.name(),
                    "run excluded from reduction"
                );
            }
        }
        Ok(())
    }
}

/// A number some earlier extraction or rule must have put in the additional values.
pub(crate) fn required_number(
    job_request: &JobRequest,
    rule: &'static str,
    key: &str,
) -> Result<f64, RuleError> {
    job_request
        .additional_values
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| RuleError::RuleViolation {
            rule,
            reason: format!("{key} is not available"),
        })
}
