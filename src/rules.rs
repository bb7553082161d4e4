//! Forward rules select the upstream destinations for an accepted DIMSE
//! request. Rules are supplied by the configuration and evaluated in
//! configured order.

use crate::dimse::Dimse;
use crate::types::{AE, UI};
use dicom::object::InMemDicomObject;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ForwardRule {
	#[serde(default)]
	pub description: Option<String>,
	/// Calling AE titles this rule applies to. Empty matches any caller.
	#[serde(default)]
	pub calling_aets: Vec<AE>,
	/// Called AE titles this rule applies to. Empty matches any called AET.
	#[serde(default)]
	pub called_aets: Vec<AE>,
	/// SOP class UIDs this rule applies to. Empty matches any SOP class.
	#[serde(default)]
	pub sop_classes: Vec<UI>,
	/// DIMSE kinds this rule applies to. Empty matches any kind.
	#[serde(default)]
	pub dimse: Vec<Dimse>,
	/// Ordered destination AE titles. Must not be empty.
	pub destinations: Vec<AE>,
	/// Overrides the calling AET recorded for the scheduled forward.
	#[serde(default)]
	pub use_calling_aet: Option<AE>,
	/// URI of an MPPS to Dose SR conversion template. Selects the
	/// transformation pipeline when set.
	#[serde(default)]
	pub mpps2dose_sr_template_uri: Option<String>,
}

/// Request attributes a rule predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
	pub calling_aet: &'a str,
	pub called_aet: &'a str,
	pub sop_class_uid: &'a str,
	pub dimse: Dimse,
}

impl ForwardRule {
	fn matches(&self, request: &RequestContext<'_>) -> bool {
		let matches_aet =
			|aets: &[AE], aet: &str| aets.is_empty() || aets.iter().any(|entry| entry == aet);

		matches_aet(&self.calling_aets, request.calling_aet)
			&& matches_aet(&self.called_aets, request.called_aet)
			&& (self.sop_classes.is_empty()
				|| self.sop_classes.iter().any(|uid| uid == request.sop_class_uid))
			&& (self.dimse.is_empty() || self.dimse.contains(&request.dimse))
	}

	/// Resolves the destination AE titles for this rule. The request's data
	/// set is available to allow per-patient or per-study routing.
	pub fn destinations(&self, data: Option<&InMemDicomObject>) -> &[AE] {
		// Configured lists are static today; the data set is accepted so
		// attribute-driven resolution can slot in without touching callers.
		let _ = data;
		&self.destinations
	}
}

/// Returns the rules matching the request, preserving configured order.
pub fn filter_forward_rules<'a>(
	rules: &'a [ForwardRule],
	request: &RequestContext<'_>,
) -> Vec<&'a ForwardRule> {
	rules.iter().filter(|rule| rule.matches(request)).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(calling_aets: &[&str], destinations: &[&str]) -> ForwardRule {
		ForwardRule {
			description: None,
			calling_aets: calling_aets.iter().map(|aet| AE::from(*aet)).collect(),
			called_aets: Vec::new(),
			sop_classes: Vec::new(),
			dimse: Vec::new(),
			destinations: destinations.iter().map(|aet| AE::from(*aet)).collect(),
			use_calling_aet: None,
			mpps2dose_sr_template_uri: None,
		}
	}

	fn request() -> RequestContext<'static> {
		RequestContext {
			calling_aet: "MOD1",
			called_aet: "DCMPRX",
			sop_class_uid: "1.2.840.10008.3.1.2.3.3",
			dimse: Dimse::NCreateRq,
		}
	}

	#[test]
	fn empty_predicates_match_any_request() {
		let rules = [rule(&[], &["ARCHIVE"])];
		let matched = filter_forward_rules(&rules, &request());
		assert_eq!(matched.len(), 1);
	}

	#[test]
	fn calling_aet_predicate_filters() {
		let rules = [rule(&["OTHER"], &["A"]), rule(&["MOD1"], &["B"])];
		let matched = filter_forward_rules(&rules, &request());
		assert_eq!(matched.len(), 1);
		assert_eq!(matched[0].destinations(None), ["B"]);
	}

	#[test]
	fn configured_order_is_preserved() {
		let rules = [rule(&[], &["FIRST"]), rule(&[], &["SECOND"])];
		let matched = filter_forward_rules(&rules, &request());
		let order: Vec<_> = matched
			.iter()
			.flat_map(|rule| rule.destinations(None))
			.collect();
		assert_eq!(order, ["FIRST", "SECOND"]);
	}

	#[test]
	fn dimse_predicate_filters() {
		let mut only_nset = rule(&[], &["A"]);
		only_nset.dimse = vec![Dimse::NSetRq];
		let rules = [only_nset];
		let matched = filter_forward_rules(&rules, &request());
		assert!(matched.is_empty());
	}
}
