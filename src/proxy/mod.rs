//! The proxy's DIMSE service class provider: accepts associations, reads
//! messages sequentially per association, and dispatches MPPS requests to
//! the MPPS service. Everything else is answered by a small default
//! handler (C-ECHO success, unrecognized operation otherwise).

use crate::config::{ApplicationEntityConfig, DimseServerConfig};
use crate::dimse::association::client::ClientAssociation;
use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::association::Association;
use crate::dimse::mpps::forward::ForwardAssociation;
use crate::dimse::mpps::service::MppsService;
use crate::dimse::mpps::{
	MppsRequest, COMMAND_FIELD_N_CREATE_REQUEST, COMMAND_FIELD_N_SET_REQUEST,
};
use crate::dimse::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, Dimse, DATA_SET_MISSING, STATUS_SUCCESS,
	STATUS_UNRECOGNIZED_OPERATION,
};
use crate::transform::TemplateCache;
use crate::types::{AE, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, instrument, warn};

const COMMAND_FIELD_C_ECHO_REQUEST: US = 0x0030;
const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed per-association state owned by the handling worker. Replaces the
/// untyped property bag of classic proxy implementations: the calling and
/// called AE titles and the optional upstream association are explicit.
pub struct SessionContext<F: Association = ClientAssociation> {
	pub calling_aet: AE,
	pub called_aet: AE,
	/// Set by the association layer when requests should be relayed live
	/// instead of spooled.
	pub forward: Option<Arc<ForwardAssociation<F>>>,
}

impl<F: Association> SessionContext<F> {
	pub const fn new(calling_aet: AE, called_aet: AE) -> Self {
		Self {
			calling_aet,
			called_aet,
			forward: None,
		}
	}

	/// Attaches an upstream association; subsequent MPPS requests on this
	/// session are relayed instead of spooled.
	pub fn attach_forward(&mut self, forward: Arc<ForwardAssociation<F>>) {
		self.forward = Some(forward);
	}
}

pub struct ProxyServiceClassProvider {
	inner: Arc<InnerProxyServiceClassProvider>,
}

struct InnerProxyServiceClassProvider {
	config: DimseServerConfig,
	ae: ApplicationEntityConfig,
	templates: Arc<TemplateCache>,
}

impl ProxyServiceClassProvider {
	pub fn new(
		config: DimseServerConfig,
		ae: ApplicationEntityConfig,
		templates: Arc<TemplateCache>,
	) -> Self {
		Self {
			inner: Arc::new(InnerProxyServiceClassProvider {
				config,
				ae,
				templates,
			}),
		}
	}

	#[instrument(skip_all, name = "PROXY-SCP")]
	pub async fn spawn(&self) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started Proxy Service Class Provider on {}", address);
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					info!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					tokio::spawn(async move {
						if let Err(err) = Self::process(stream, inner).await {
							error!("Association worker failed: {err}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	async fn process(
		stream: TcpStream,
		inner: Arc<InnerProxyServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// The dicom-ul crate reads and writes blocking; the actual IO runs
		// on the dedicated thread inside ServerAssociation.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			uncompressed: inner.config.uncompressed,
		};
		let association = Arc::new(ServerAssociation::new(options).await?);
		let session: SessionContext = SessionContext::new(
			AE::from(association.calling_aet()),
			AE::from(association.called_aet()),
		);
		let mpps = MppsService::new(Arc::clone(&inner.templates));

		// Duration::MAX to indefinitely wait for incoming messages
		while let Ok(message) = association.read_message(Duration::MAX).await {
			let presentation_context_id = message
				.presentation_context_id
				.or_else(|| association.presentation_contexts().first().map(|pctx| pctx.id))
				.unwrap_or(1);

			match mpps_dimse(&message) {
				Some(dimse) => {
					let sop_class_uid = message.command_str(MppsRequest::sop_class_uid_tag(dimse));
					let sop_instance_uid =
						message.command_str(MppsRequest::sop_instance_uid_tag(dimse));
					let message_id = message.command_int(tags::MESSAGE_ID).unwrap_or(0);

					if let Err(err) = mpps
						.on_dimse_request(
							&association,
							&session,
							&inner.ae,
							presentation_context_id,
							dimse,
							message,
						)
						.await
					{
						error!("{}: error processing {dimse}: {err}", session.calling_aet);
						let response = crate::dimse::mpps::MppsResponse {
							dimse,
							sop_class_uid: sop_class_uid.unwrap_or_default(),
							sop_instance_uid: sop_instance_uid.unwrap_or_default(),
							message_id,
							status: err.status(),
							data_set: None,
						};
						if let Err(err) = association
							.write_message(
								response,
								Some(presentation_context_id),
								RESPONSE_WRITE_TIMEOUT,
							)
							.await
						{
							warn!("<< {dimse}-RSP failed: {err}");
						}
					}
				}
				None => {
					let response = default_response(&message);
					if let Err(err) = association
						.write_message(
							response,
							Some(presentation_context_id),
							RESPONSE_WRITE_TIMEOUT,
						)
						.await
					{
						warn!("<< default RSP failed: {err}");
					}
				}
			}
		}
		Ok(())
	}
}

/// MPPS requests are N-CREATE-RQ/N-SET-RQ for the MPPS SOP class.
fn mpps_dimse(message: &DicomMessage) -> Option<Dimse> {
	let dimse = match message.command_int(tags::COMMAND_FIELD)? {
		COMMAND_FIELD_N_CREATE_REQUEST => Dimse::NCreateRq,
		COMMAND_FIELD_N_SET_REQUEST => Dimse::NSetRq,
		_ => return None,
	};

	let sop_class_uid = message.command_str(MppsRequest::sop_class_uid_tag(dimse))?;
	(sop_class_uid == uids::MODALITY_PERFORMED_PROCEDURE_STEP).then_some(dimse)
}

/// Fallback for everything that is not an MPPS request: C-ECHO-RQ is
/// answered with success, anything else with "unrecognized operation".
fn default_response(message: &DicomMessage) -> DicomMessage {
	let command_field = message.command_int(tags::COMMAND_FIELD).unwrap_or(0);
	let message_id = message.command_int(tags::MESSAGE_ID).unwrap_or(0);
	let status = if command_field == COMMAND_FIELD_C_ECHO_REQUEST {
		STATUS_SUCCESS
	} else {
		STATUS_UNRECOGNIZED_OPERATION
	};

	let mut command = InMemDicomObject::command_from_element_iter([
		DataElement::new(
			tags::COMMAND_FIELD,
			VR::US,
			dicom_value!(U16, [command_field | 0x8000]),
		),
		DataElement::new(
			tags::MESSAGE_ID_BEING_RESPONDED_TO,
			VR::US,
			dicom_value!(U16, [message_id]),
		),
		DataElement::new(
			tags::COMMAND_DATA_SET_TYPE,
			VR::US,
			dicom_value!(U16, [DATA_SET_MISSING]),
		),
		DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
	]);
	if let Some(sop_class_uid) = message.command_str(tags::AFFECTED_SOP_CLASS_UID) {
		command.put(DataElement::new(
			tags::AFFECTED_SOP_CLASS_UID,
			VR::UI,
			dicom_value!(Str, sop_class_uid),
		));
	}

	DicomMessage {
		command,
		data: None,
		presentation_context_id: message.presentation_context_id,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn command(elements: Vec<DataElement<InMemDicomObject>>) -> DicomMessage {
		DicomMessage {
			command: InMemDicomObject::command_from_element_iter(elements),
			data: None,
			presentation_context_id: Some(1),
		}
	}

	#[test]
	fn echo_requests_get_a_success_response() {
		let message = command(vec![
			DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [COMMAND_FIELD_C_ECHO_REQUEST]),
			),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [3])),
		]);

		let response = default_response(&message);
		assert_eq!(response.command_int(tags::COMMAND_FIELD), Some(0x8030));
		assert_eq!(response.command_int(tags::STATUS), Some(STATUS_SUCCESS));
		assert_eq!(
			response.command_int(tags::MESSAGE_ID_BEING_RESPONDED_TO),
			Some(3)
		);
	}

	#[test]
	fn unknown_commands_are_rejected() {
		// C-STORE-RQ is not served by this proxy core.
		let message = command(vec![
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [4])),
		]);

		let response = default_response(&message);
		assert_eq!(
			response.command_int(tags::STATUS),
			Some(STATUS_UNRECOGNIZED_OPERATION)
		);
	}

	#[test]
	fn mpps_dispatch_requires_the_mpps_sop_class() {
		let message = command(vec![
			DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [COMMAND_FIELD_N_CREATE_REQUEST]),
			),
			DataElement::new(
				tags::AFFECTED_SOP_CLASS_UID,
				VR::UI,
				dicom_value!(Str, uids::MODALITY_PERFORMED_PROCEDURE_STEP),
			),
		]);
		assert_eq!(mpps_dimse(&message), Some(Dimse::NCreateRq));

		let other = command(vec![
			DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [COMMAND_FIELD_N_CREATE_REQUEST]),
			),
			DataElement::new(
				tags::AFFECTED_SOP_CLASS_UID,
				VR::UI,
				dicom_value!(Str, uids::VERIFICATION),
			),
		]);
		assert_eq!(mpps_dimse(&other), None);
	}
}
