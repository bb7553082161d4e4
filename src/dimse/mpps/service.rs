//! The MPPS service: dispatches accepted N-CREATE-RQ/N-SET-RQ messages to
//! the live forwarder or the spool, and answers the peer once persistence
//! is durable.

use crate::config::ApplicationEntityConfig;
use crate::dimse::association::Association;
use crate::dimse::mpps::forward::{AcceptedAssociationSink, ForwardError};
use crate::dimse::mpps::{MppsRequest, MppsResponse};
use crate::dimse::{
	DicomMessage, DicomMessageWriter, Dimse, NegotiationError, STATUS_OUT_OF_RESOURCES,
	STATUS_PROCESSING_FAILURE, STATUS_SUCCESS, STATUS_UNABLE_TO_PROCESS,
};
use crate::proxy::SessionContext;
use crate::rules::{filter_forward_rules, ForwardRule, RequestContext};
use crate::spool::{self, SpoolEntry, SpoolError, DCM_SUFFIX, INFO_SUFFIX, NCREATE_SUFFIX};
use crate::transform::{create_uid, TemplateCache, TransformError, TransformParameters};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTable, FileMetaTableBuilder, InMemDicomObject, Tag};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MppsError {
	#[error("no matching forward rule")]
	NoMatchingRule,
	#[error("Missing attribute {0} in command set")]
	MissingAttribute(Tag),
	#[error(transparent)]
	Spool(#[from] SpoolError),
	#[error(transparent)]
	Transform(#[from] TransformError),
	#[error(transparent)]
	Forward(#[from] ForwardError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

impl MppsError {
	/// The DIMSE status reported to the peer for this error.
	pub fn status(&self) -> US {
		match self {
			Self::NoMatchingRule | Self::MissingAttribute(_) | Self::Transform(_) => {
				STATUS_PROCESSING_FAILURE
			}
			// A missing or unreadable .ncreate half is a protocol-state
			// problem, not an exhausted resource.
			Self::Spool(SpoolError::ReadFile { .. }) => STATUS_PROCESSING_FAILURE,
			Self::Spool(_) => STATUS_OUT_OF_RESOURCES,
			Self::Forward(_) | Self::Negotiation(_) => STATUS_UNABLE_TO_PROCESS,
		}
	}
}

pub struct MppsService {
	templates: Arc<TemplateCache>,
}

impl MppsService {
	pub const fn new(templates: Arc<TemplateCache>) -> Self {
		Self { templates }
	}

	/// Handles one accepted N-CREATE-RQ/N-SET-RQ. On success the response
	/// has already been written (spool path) or will be written by the
	/// response sink once the upstream answers (live-forward path). On
	/// error the caller reports [`MppsError::status`] to the peer.
	pub async fn on_dimse_request<A, F>(
		&self,
		accepted: &Arc<A>,
		session: &SessionContext<F>,
		ae: &ApplicationEntityConfig,
		presentation_context_id: u8,
		dimse: Dimse,
		message: DicomMessage,
	) -> Result<(), MppsError>
	where
		A: Association + Send + Sync + 'static,
		F: Association + Send + Sync + 'static,
	{
		if let Some(forward) = &session.forward {
			return self
				.forward_request(accepted, forward, presentation_context_id, dimse, message)
				.await;
		}

		self.process_forward_rules(accepted, session, ae, presentation_context_id, dimse, message)
			.await
	}

	async fn forward_request<A, F>(
		&self,
		accepted: &Arc<A>,
		forward: &Arc<crate::dimse::mpps::forward::ForwardAssociation<F>>,
		presentation_context_id: u8,
		dimse: Dimse,
		message: DicomMessage,
	) -> Result<(), MppsError>
	where
		A: Association + Send + Sync + 'static,
		F: Association + Send + Sync + 'static,
	{
		let sop_class_uid = command_str(&message, MppsRequest::sop_class_uid_tag(dimse))?;
		let sop_instance_uid = command_str(&message, MppsRequest::sop_instance_uid_tag(dimse))?;
		let message_id = message.command_int(tags::MESSAGE_ID).unwrap_or(0);

		let transfer_syntax_uid = accepted
			.presentation_contexts()
			.iter()
			.find(|pctx| pctx.id == presentation_context_id)
			.map(|pctx| pctx.transfer_syntax.clone())
			.ok_or(NegotiationError::NoPresentationContext)?;

		let sink = AcceptedAssociationSink::new(Arc::clone(accepted), presentation_context_id);
		forward
			.relay(
				dimse,
				sop_class_uid,
				sop_instance_uid,
				message_id,
				message.data,
				&transfer_syntax_uid,
				Box::new(sink),
			)
			.await?;
		Ok(())
	}

	async fn process_forward_rules<A, F>(
		&self,
		accepted: &Arc<A>,
		session: &SessionContext<F>,
		ae: &ApplicationEntityConfig,
		presentation_context_id: u8,
		dimse: Dimse,
		message: DicomMessage,
	) -> Result<(), MppsError>
	where
		A: Association + Send + Sync + 'static,
		F: Association + Send + Sync + 'static,
	{
		let sop_class_uid = command_str(&message, MppsRequest::sop_class_uid_tag(dimse))?;
		let sop_instance_uid = command_str(&message, MppsRequest::sop_instance_uid_tag(dimse))?;
		let message_id = message.command_int(tags::MESSAGE_ID).unwrap_or(0);

		let request = RequestContext {
			calling_aet: &session.calling_aet,
			called_aet: &session.called_aet,
			sop_class_uid: &sop_class_uid,
			dimse,
		};
		let rules = filter_forward_rules(&ae.forward_rules, &request);
		if rules.is_empty() {
			return Err(MppsError::NoMatchingRule);
		}

		let fmi = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(sop_class_uid.as_str())
			.media_storage_sop_instance_uid(sop_instance_uid.as_str())
			.transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.build()
			.expect("FileMetaTableBuilder should contain required data");

		let data = message.data.unwrap_or_else(InMemDicomObject::new_empty);

		for rule in rules {
			for destination in rule.destinations(Some(&data)) {
				if let Some(template_uri) = &rule.mpps2dose_sr_template_uri {
					self.process_mpps2dose_sr(
						session,
						ae,
						dimse,
						&data,
						&sop_instance_uid,
						&fmi,
						destination,
						rule,
						template_uri,
					)?;
				} else {
					let base_dir = match dimse {
						Dimse::NCreateRq => &ae.spool.ncreate_dir,
						Dimse::NSetRq => &ae.spool.nset_dir,
					};
					let temp_path = spool::create(&SpoolEntry {
						base_dir,
						destination_aet: destination,
						fmi: fmi.clone(),
						data: &data,
						source_aet: &session.calling_aet,
						use_calling_aet: rule.use_calling_aet.as_deref(),
					})?;
					spool::rename(&temp_path, &sop_instance_uid, DCM_SUFFIX)?;
				}
			}
		}

		let response = MppsResponse {
			dimse,
			sop_class_uid,
			sop_instance_uid,
			message_id,
			status: STATUS_SUCCESS,
			data_set: Some(data),
		};
		if let Err(err) = accepted
			.write_message(response, Some(presentation_context_id), RESPONSE_WRITE_TIMEOUT)
			.await
		{
			// The peer is gone; the spool entries stay valid regardless.
			warn!("<< {dimse}-RSP failed: {err}");
		}

		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	fn process_mpps2dose_sr<F>(
		&self,
		session: &SessionContext<F>,
		ae: &ApplicationEntityConfig,
		dimse: Dimse,
		data: &InMemDicomObject,
		sop_instance_uid: &str,
		fmi: &FileMetaTable,
		destination: &str,
		rule: &ForwardRule,
		template_uri: &str,
	) -> Result<(), MppsError>
	where
		F: Association,
	{
		match dimse {
			Dimse::NCreateRq => {
				// First half: keep the N-CREATE attributes until the
				// matching N-SET arrives.
				let temp_path = spool::create(&SpoolEntry {
					base_dir: &ae.spool.dose_sr_dir,
					destination_aet: destination,
					fmi: fmi.clone(),
					data,
					source_aet: &session.calling_aet,
					use_calling_aet: rule.use_calling_aet.as_deref(),
				})?;
				spool::rename(&temp_path, sop_instance_uid, NCREATE_SUFFIX)?;
				Ok(())
			}
			Dimse::NSetRq => self.process_nset_mpps2dose_sr(
				session,
				ae,
				data,
				sop_instance_uid,
				fmi,
				destination,
				rule,
				template_uri,
			),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn process_nset_mpps2dose_sr<F>(
		&self,
		session: &SessionContext<F>,
		ae: &ApplicationEntityConfig,
		data: &InMemDicomObject,
		sop_instance_uid: &str,
		fmi: &FileMetaTable,
		destination: &str,
		rule: &ForwardRule,
		template_uri: &str,
	) -> Result<(), MppsError>
	where
		F: Association,
	{
		let ncreate_path = ae
			.spool
			.dose_sr_dir
			.join(destination)
			.join(format!("{sop_instance_uid}.{NCREATE_SUFFIX}"));
		let ncreate = spool::read(&ncreate_path)?;

		// Merge the deferred N-CREATE attributes into the N-SET data set;
		// N-SET attributes win on conflict.
		let mut merged = data.clone();
		for element in ncreate.into_inner() {
			if merged.get(element.header().tag).is_none() {
				merged.put(element);
			}
		}

		let parameters = TransformParameters::new(
			sop_instance_uid,
			&session.calling_aet,
			UI::from(fmi.media_storage_sop_instance_uid()),
		)?;
		let template = self.templates.get(template_uri)?;
		let mut dose_sr_data = template.apply(&merged, &parameters)?;

		let dose_iuid = create_uid();
		dose_sr_data.put(DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, dose_iuid.clone()),
		));
		dose_sr_data.put(DataElement::new(
			tags::SERIES_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, create_uid()),
		));

		let dose_sr_fmi = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(uids::X_RAY_RADIATION_DOSE_SR_STORAGE)
			.media_storage_sop_instance_uid(dose_iuid.as_str())
			.transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
			.build()
			.expect("FileMetaTableBuilder should contain required data");

		let temp_path = spool::create(&SpoolEntry {
			base_dir: &ae.spool.cstore_dir,
			destination_aet: destination,
			fmi: dose_sr_fmi,
			data: &dose_sr_data,
			source_aet: &session.calling_aet,
			use_calling_aet: rule.use_calling_aet.as_deref(),
		})?;
		let dose_sr_path = spool::rename(&temp_path, &dose_iuid, DCM_SUFFIX)?;
		info!("created Dose SR file {}", dose_sr_path.display());

		spool::delete(&ncreate_path);
		Ok(())
	}
}

fn command_str(message: &DicomMessage, tag: Tag) -> Result<UI, MppsError> {
	message
		.command_str(tag)
		.ok_or(MppsError::MissingAttribute(tag))
}
