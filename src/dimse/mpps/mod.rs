//! Modality Performed Procedure Step (MPPS) handling.
//!
//! The MPPS service accepts N-CREATE-RQ/N-SET-RQ pairs and either relays
//! them to an attached upstream association or spools them for deferred
//! forwarding, optionally converting the pair into an X-Ray Radiation
//! Dose SR object.

pub mod forward;
pub mod service;

use crate::dimse::{DicomMessage, Dimse, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::{InMemDicomObject, Tag};

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_N_CREATE_REQUEST: US = 0x0140;
pub const COMMAND_FIELD_N_CREATE_RESPONSE: US = 0x8140;
pub const COMMAND_FIELD_N_SET_REQUEST: US = 0x0120;
pub const COMMAND_FIELD_N_SET_RESPONSE: US = 0x8120;

/// N-CREATE-RQ / N-SET-RQ
pub struct MppsRequest {
	pub dimse: Dimse,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub message_id: US,
	pub data_set: Option<InMemDicomObject>,
}

impl MppsRequest {
	/// The tag carrying the SOP class UID for this request kind:
	/// Affected* for N-CREATE, Requested* for N-SET.
	pub const fn sop_class_uid_tag(dimse: Dimse) -> Tag {
		match dimse {
			Dimse::NCreateRq => tags::AFFECTED_SOP_CLASS_UID,
			Dimse::NSetRq => tags::REQUESTED_SOP_CLASS_UID,
		}
	}

	/// The tag carrying the SOP instance UID for this request kind.
	pub const fn sop_instance_uid_tag(dimse: Dimse) -> Tag {
		match dimse {
			Dimse::NCreateRq => tags::AFFECTED_SOP_INSTANCE_UID,
			Dimse::NSetRq => tags::REQUESTED_SOP_INSTANCE_UID,
		}
	}
}

impl From<MppsRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: MppsRequest) -> Self {
		let command_field = match request.dimse {
			Dimse::NCreateRq => COMMAND_FIELD_N_CREATE_REQUEST,
			Dimse::NSetRq => COMMAND_FIELD_N_SET_REQUEST,
		};
		let data_set_type = if request.data_set.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };

		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(MppsRequest::sop_class_uid_tag(request.dimse), VR::UI, dicom_value!(Str, request.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(MppsRequest::sop_instance_uid_tag(request.dimse), VR::UI, dicom_value!(Str, request.sop_instance_uid)),
		]);

		Self {
			command,
			data: request.data_set,
			presentation_context_id: None,
		}
	}
}

/// N-CREATE-RSP / N-SET-RSP, mirroring the request command.
pub struct MppsResponse {
	pub dimse: Dimse,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub message_id: US,
	pub status: US,
	pub data_set: Option<InMemDicomObject>,
}

impl From<MppsResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: MppsResponse) -> Self {
		let command_field = match response.dimse {
			Dimse::NCreateRq => COMMAND_FIELD_N_CREATE_RESPONSE,
			Dimse::NSetRq => COMMAND_FIELD_N_SET_RESPONSE,
		};
		let data_set_type = if response.data_set.is_some() { DATA_SET_EXISTS } else { DATA_SET_MISSING };

		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [data_set_type])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self {
			command,
			data: response.data_set,
			presentation_context_id: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement;

	#[test]
	fn nset_request_uses_requested_uids() {
		let request = MppsRequest {
			dimse: Dimse::NSetRq,
			sop_class_uid: UI::from("1.2.840.10008.3.1.2.3.3"),
			sop_instance_uid: UI::from("9.9"),
			message_id: 7,
			data_set: None,
		};

		let message = DicomMessage::from(request);
		assert_eq!(
			message.command_str(tags::REQUESTED_SOP_INSTANCE_UID).as_deref(),
			Some("9.9")
		);
		assert_eq!(
			message.command_int(tags::COMMAND_FIELD),
			Some(COMMAND_FIELD_N_SET_REQUEST)
		);
		assert_eq!(
			message.command_int(tags::COMMAND_DATA_SET_TYPE),
			Some(DATA_SET_MISSING)
		);
	}

	#[test]
	fn response_mirrors_request_command() {
		let response = MppsResponse {
			dimse: Dimse::NCreateRq,
			sop_class_uid: UI::from("1.2.840.10008.3.1.2.3.3"),
			sop_instance_uid: UI::from("1.2.3"),
			message_id: 42,
			status: crate::dimse::STATUS_SUCCESS,
			data_set: None,
		};

		let message = DicomMessage::from(response);
		assert_eq!(
			message.command_int(tags::COMMAND_FIELD),
			Some(COMMAND_FIELD_N_CREATE_RESPONSE)
		);
		assert_eq!(
			message.command_int(tags::MESSAGE_ID_BEING_RESPONDED_TO),
			Some(42)
		);
		assert_eq!(
			message
				.command
				.get(tags::STATUS)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok),
			Some(crate::dimse::STATUS_SUCCESS)
		);
	}
}
