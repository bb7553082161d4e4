//! MPPS to X-Ray Radiation Dose SR conversion.
//!
//! The conversion is driven by a template file referenced from the forward
//! rule. A template declares the output elements of the Dose SR data set;
//! element values are literals (with `${...}` parameter interpolation),
//! copies of attributes from the merged MPPS data set, or nested sequence
//! items. Compiled templates are cached process-wide and invalidated when
//! the configuration is reloaded.

use crate::types::UI;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{InMemDicomObject, StandardDataDictionary};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransformError {
	#[error("Failed to load template {uri}: {source}")]
	Load {
		uri: String,
		source: config::ConfigError,
	},
	#[error("Invalid template {uri}: {reason}")]
	Invalid { uri: String, reason: String },
	#[error("Unknown attribute name '{0}'")]
	UnknownAttribute(String),
	#[error("Unknown transformation parameter '{0}'")]
	UnknownParameter(String),
	#[error("Calling AET '{0}' does not encode to a device observer UID")]
	DeviceObserver(String),
}

/// Returns a new UID under the UUID-derived OID root.
pub fn create_uid() -> UI {
	format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// Derives the `DeviceObserverUID` parameter from the calling AE title:
/// the lowercase hex encoding of the title's bytes, interpreted as a
/// base-16 integer and rendered in decimal. AE titles are at most 16
/// bytes, so the value always fits into an u128.
pub fn device_observer_uid(calling_aet: &str) -> Result<String, TransformError> {
	let hex: String = calling_aet.bytes().map(|byte| format!("{byte:02x}")).collect();
	u128::from_str_radix(&hex, 16)
		.map(|value| value.to_string())
		.map_err(|_| TransformError::DeviceObserver(String::from(calling_aet)))
}

/// Runtime identifiers substituted into `${...}` placeholders.
#[derive(Debug, Clone)]
pub struct TransformParameters {
	pub irradiation_event_uid: UI,
	pub device_observer_uid: String,
	pub performed_procedure_step_sop_instance_uid: UI,
}

impl TransformParameters {
	/// Builds the parameter set for one MPPS instance: the irradiation
	/// event UID is the instance UID with `"1"` appended, the device
	/// observer UID is derived from the calling AE title.
	pub fn new(
		iuid: &str,
		calling_aet: &str,
		performed_procedure_step_sop_instance_uid: UI,
	) -> Result<Self, TransformError> {
		Ok(Self {
			irradiation_event_uid: format!("{iuid}1"),
			device_observer_uid: device_observer_uid(calling_aet)?,
			performed_procedure_step_sop_instance_uid,
		})
	}

	fn resolve(&self, name: &str) -> Option<&str> {
		match name {
			"IrradiationEventUID" => Some(&self.irradiation_event_uid),
			"DeviceObserverUID" => Some(&self.device_observer_uid),
			"PerformedProcedureStepSOPInstanceUID" => {
				Some(&self.performed_procedure_step_sop_instance_uid)
			}
			_ => None,
		}
	}
}

/// Raw template file contents, deserialized with serde.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TemplateSpec {
	elements: Vec<ElementSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ElementSpec {
	/// Attribute keyword or `GGGG,EEEE` hex pair.
	tag: String,
	#[serde(default)]
	vr: Option<String>,
	/// Literal output value, with `${Parameter}` interpolation.
	#[serde(default)]
	value: Option<String>,
	/// Attribute of the merged MPPS data set to copy the value from.
	#[serde(default)]
	from: Option<String>,
	/// Nested sequence items.
	#[serde(default)]
	items: Option<Vec<ItemSpec>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ItemSpec {
	elements: Vec<ElementSpec>,
}

/// A template compiled into tag/VR-resolved form.
#[derive(Debug)]
pub struct DoseSrTemplate {
	elements: Vec<CompiledElement>,
}

#[derive(Debug)]
struct CompiledElement {
	tag: Tag,
	vr: Option<VR>,
	source: CompiledSource,
}

#[derive(Debug)]
enum CompiledSource {
	Literal(Vec<Segment>),
	From(Tag),
	Sequence(Vec<Vec<CompiledElement>>),
}

#[derive(Debug)]
enum Segment {
	Text(String),
	Parameter(String),
}

impl DoseSrTemplate {
	/// Loads and compiles the template behind the given URI. Templates are
	/// YAML files; a `file://` scheme prefix is accepted.
	pub fn compile(uri: &str) -> Result<Self, TransformError> {
		let path = uri.strip_prefix("file://").unwrap_or(uri);
		let spec: TemplateSpec = config::Config::builder()
			.add_source(config::File::new(path, config::FileFormat::Yaml))
			.build()
			.and_then(config::Config::try_deserialize)
			.map_err(|source| TransformError::Load {
				uri: String::from(uri),
				source,
			})?;

		let elements = spec
			.elements
			.iter()
			.map(|element| compile_element(uri, element))
			.collect::<Result<_, _>>()?;

		Ok(Self { elements })
	}

	/// Streams the merged MPPS data set through the template and returns
	/// the Dose SR data set.
	pub fn apply(
		&self,
		data: &InMemDicomObject,
		parameters: &TransformParameters,
	) -> Result<InMemDicomObject, TransformError> {
		let mut output = InMemDicomObject::new_empty();
		apply_elements(&self.elements, data, parameters, &mut output)?;
		Ok(output)
	}
}

fn apply_elements(
	elements: &[CompiledElement],
	data: &InMemDicomObject,
	parameters: &TransformParameters,
	output: &mut InMemDicomObject,
) -> Result<(), TransformError> {
	for element in elements {
		match &element.source {
			CompiledSource::Literal(segments) => {
				let mut value = String::new();
				for segment in segments {
					match segment {
						Segment::Text(text) => value.push_str(text),
						Segment::Parameter(name) => {
							let resolved = parameters
								.resolve(name)
								.ok_or_else(|| TransformError::UnknownParameter(name.clone()))?;
							value.push_str(resolved);
						}
					}
				}
				output.put(DataElement::new(
					element.tag,
					element.vr.unwrap_or(VR::LO),
					PrimitiveValue::from(value),
				));
			}
			CompiledSource::From(source_tag) => {
				// Absent source attributes yield no output element.
				if let Some(source) = data.get(*source_tag) {
					let vr = element.vr.unwrap_or_else(|| source.header().vr);
					output.put(DataElement::new(element.tag, vr, source.value().clone()));
				}
			}
			CompiledSource::Sequence(items) => {
				let mut objects = Vec::with_capacity(items.len());
				for item in items {
					let mut object = InMemDicomObject::new_empty();
					apply_elements(item, data, parameters, &mut object)?;
					objects.push(object);
				}
				output.put(DataElement::new(
					element.tag,
					VR::SQ,
					Value::Sequence(DataSetSequence::from(objects)),
				));
			}
		}
	}
	Ok(())
}

fn compile_element(uri: &str, spec: &ElementSpec) -> Result<CompiledElement, TransformError> {
	let tag = parse_tag(&spec.tag)?;
	let vr = spec
		.vr
		.as_deref()
		.map(|vr| {
			parse_vr(vr).ok_or_else(|| TransformError::Invalid {
				uri: String::from(uri),
				reason: format!("unknown VR '{vr}' for tag {tag}"),
			})
		})
		.transpose()?;

	let source = match (&spec.value, &spec.from, &spec.items) {
		(Some(value), None, None) => CompiledSource::Literal(parse_segments(value)),
		(None, Some(from), None) => CompiledSource::From(parse_tag(from)?),
		(None, None, Some(items)) => {
			let compiled = items
				.iter()
				.map(|item| {
					item.elements
						.iter()
						.map(|element| compile_element(uri, element))
						.collect::<Result<Vec<_>, _>>()
				})
				.collect::<Result<_, _>>()?;
			CompiledSource::Sequence(compiled)
		}
		_ => {
			return Err(TransformError::Invalid {
				uri: String::from(uri),
				reason: format!("tag {tag} must declare exactly one of value, from or items"),
			})
		}
	};

	Ok(CompiledElement { tag, vr, source })
}

fn parse_segments(value: &str) -> Vec<Segment> {
	let mut segments = Vec::new();
	let mut rest = value;
	while let Some(start) = rest.find("${") {
		if let Some(length) = rest[start..].find('}') {
			if start > 0 {
				segments.push(Segment::Text(String::from(&rest[..start])));
			}
			segments.push(Segment::Parameter(String::from(&rest[start + 2..start + length])));
			rest = &rest[start + length + 1..];
		} else {
			break;
		}
	}
	if !rest.is_empty() {
		segments.push(Segment::Text(String::from(rest)));
	}
	segments
}

fn parse_tag(spec: &str) -> Result<Tag, TransformError> {
	let trimmed = spec.trim().trim_start_matches('(').trim_end_matches(')');
	if let Some((group, element)) = trimmed.split_once(',') {
		if let (Ok(group), Ok(element)) = (
			u16::from_str_radix(group.trim(), 16),
			u16::from_str_radix(element.trim(), 16),
		) {
			return Ok(Tag(group, element));
		}
	}

	StandardDataDictionary
		.by_name(trimmed)
		.map(|entry| entry.tag.inner())
		.ok_or_else(|| TransformError::UnknownAttribute(String::from(trimmed)))
}

fn parse_vr(vr: &str) -> Option<VR> {
	let vr = match vr {
		"AE" => VR::AE,
		"AS" => VR::AS,
		"AT" => VR::AT,
		"CS" => VR::CS,
		"DA" => VR::DA,
		"DS" => VR::DS,
		"DT" => VR::DT,
		"FL" => VR::FL,
		"FD" => VR::FD,
		"IS" => VR::IS,
		"LO" => VR::LO,
		"LT" => VR::LT,
		"OB" => VR::OB,
		"OW" => VR::OW,
		"PN" => VR::PN,
		"SH" => VR::SH,
		"SL" => VR::SL,
		"SQ" => VR::SQ,
		"SS" => VR::SS,
		"ST" => VR::ST,
		"TM" => VR::TM,
		"UC" => VR::UC,
		"UI" => VR::UI,
		"UL" => VR::UL,
		"UN" => VR::UN,
		"UR" => VR::UR,
		"US" => VR::US,
		"UT" => VR::UT,
		_ => return None,
	};
	Some(vr)
}

/// Process-wide cache of compiled templates, keyed by URI. Cleared when
/// the configuration is reloaded.
#[derive(Debug, Default)]
pub struct TemplateCache {
	templates: RwLock<HashMap<String, Arc<DoseSrTemplate>>>,
}

impl TemplateCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the compiled template for the URI, compiling on a miss.
	pub fn get(&self, uri: &str) -> Result<Arc<DoseSrTemplate>, TransformError> {
		if let Some(template) = self.templates.read().expect("lock poisoned").get(uri) {
			return Ok(Arc::clone(template));
		}

		let compiled = Arc::new(DoseSrTemplate::compile(uri)?);
		self.templates
			.write()
			.expect("lock poisoned")
			.insert(String::from(uri), Arc::clone(&compiled));
		Ok(compiled)
	}

	/// Drops every compiled template so the next use re-reads its source.
	pub fn clear(&self) {
		self.templates.write().expect("lock poisoned").clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::VR;
	use dicom::dicom_value;
	use dicom::dictionary_std::tags;
	use std::io::Write;
	use std::path::Path;

	const TEMPLATE: &str = r"
elements:
  - tag: '0008,0016'
    vr: UI
    value: '1.2.840.10008.5.1.4.1.1.88.67'
  - tag: IrradiationEventUID
    vr: UI
    value: '${IrradiationEventUID}'
  - tag: '0040,A730'
    items:
      - elements:
          - tag: '0040,A124'
            vr: UI
            value: '${DeviceObserverUID}'
  - tag: PatientID
    from: PatientID
";

	fn write_template(dir: &Path, name: &str) -> String {
		let path = dir.join(name);
		let mut file = std::fs::File::create(&path).unwrap();
		file.write_all(TEMPLATE.as_bytes()).unwrap();
		path.to_str().unwrap().to_string()
	}

	fn parameters() -> TransformParameters {
		TransformParameters::new("9.9", "MOD1", UI::from("9.9")).unwrap()
	}

	#[test]
	fn device_observer_uid_is_hex_as_base16_integer() {
		// hex("MOD1") = 4d4f4431
		assert_eq!(device_observer_uid("MOD1").unwrap(), "1297040433");
	}

	#[test]
	fn parameters_append_one_to_irradiation_event_uid() {
		let parameters = parameters();
		assert_eq!(parameters.irradiation_event_uid, "9.91");
		assert_eq!(parameters.performed_procedure_step_sop_instance_uid, "9.9");
	}

	#[test]
	fn template_applies_literals_parameters_and_copies() {
		let tmp = tempfile::tempdir().unwrap();
		let uri = write_template(tmp.path(), "mpps2dosesr.yaml");
		let template = DoseSrTemplate::compile(&uri).unwrap();

		let data = InMemDicomObject::from_element_iter([DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			dicom_value!(Str, "PAT-1"),
		)]);

		let output = template.apply(&data, &parameters()).unwrap();
		assert_eq!(
			output.get(tags::SOP_CLASS_UID).unwrap().to_str().unwrap(),
			"1.2.840.10008.5.1.4.1.1.88.67"
		);
		assert_eq!(
			output
				.get(tags::IRRADIATION_EVENT_UID)
				.unwrap()
				.to_str()
				.unwrap(),
			"9.91"
		);
		assert_eq!(output.get(tags::PATIENT_ID).unwrap().to_str().unwrap(), "PAT-1");

		let content = output.get(tags::CONTENT_SEQUENCE).unwrap();
		let items = content.items().expect("sequence items");
		assert_eq!(
			items[0].get(tags::UID).unwrap().to_str().unwrap(),
			device_observer_uid("MOD1").unwrap()
		);
	}

	#[test]
	fn absent_copy_source_yields_no_element() {
		let tmp = tempfile::tempdir().unwrap();
		let uri = write_template(tmp.path(), "mpps2dosesr.yaml");
		let template = DoseSrTemplate::compile(&uri).unwrap();

		let output = template
			.apply(&InMemDicomObject::new_empty(), &parameters())
			.unwrap();
		assert!(output.get(tags::PATIENT_ID).is_none());
	}

	#[test]
	fn cache_compiles_once_and_clears() {
		let tmp = tempfile::tempdir().unwrap();
		let uri = write_template(tmp.path(), "mpps2dosesr.yaml");
		let cache = TemplateCache::new();

		let first = cache.get(&uri).unwrap();
		let second = cache.get(&uri).unwrap();
		assert!(Arc::ptr_eq(&first, &second));

		cache.clear();
		let third = cache.get(&uri).unwrap();
		assert!(!Arc::ptr_eq(&first, &third));
	}

	#[test]
	fn unknown_parameter_is_rejected() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("bad.yaml");
		std::fs::write(
			&path,
			"elements:\n  - tag: '0008,0018'\n    vr: UI\n    value: '${Nope}'\n",
		)
		.unwrap();

		let template = DoseSrTemplate::compile(path.to_str().unwrap()).unwrap();
		let result = template.apply(&InMemDicomObject::new_empty(), &parameters());
		assert!(matches!(result, Err(TransformError::UnknownParameter(_))));
	}

	#[test]
	fn fresh_uids_use_the_uuid_oid_root() {
		let uid = create_uid();
		assert!(uid.starts_with("2.25."));
		assert_ne!(uid, create_uid());
		assert!(uid.len() <= 64);
	}
}
