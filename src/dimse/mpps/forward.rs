//! Live forwarding of MPPS requests over an already-open upstream
//! association.
//!
//! The request is relayed without waiting for the upstream response: a
//! response sink is registered under the message id and the upstream reader
//! task routes the N-CREATE-RSP/N-SET-RSP back to it when it arrives. The
//! accepting association stays free to take further requests in between.

use crate::dimse::association::Association;
use crate::dimse::mpps::MppsRequest;
use crate::dimse::{DicomMessage, DicomMessageReader, DicomMessageWriter, Dimse, WriteError};
use crate::types::{UI, US};
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ForwardError {
	#[error("Failed to relay request upstream: {0}")]
	Write(#[from] WriteError),
}

/// Receives the upstream response for one relayed request.
#[async_trait]
pub trait DimseResponseSink: Send + Sync {
	async fn on_response(&self, message: DicomMessage);
}

/// Writes the upstream response back to the accepting association under
/// the presentation context the request arrived on. Write errors mean the
/// peer is gone and are logged, not raised.
pub struct AcceptedAssociationSink<A> {
	accepted: Arc<A>,
	presentation_context_id: u8,
}

impl<A> AcceptedAssociationSink<A> {
	pub const fn new(accepted: Arc<A>, presentation_context_id: u8) -> Self {
		Self {
			accepted,
			presentation_context_id,
		}
	}
}

#[async_trait]
impl<A: Association + Send + Sync> DimseResponseSink for AcceptedAssociationSink<A> {
	async fn on_response(&self, message: DicomMessage) {
		if let Err(err) = self
			.accepted
			.write_message(
				message,
				Some(self.presentation_context_id),
				RESPONSE_WRITE_TIMEOUT,
			)
			.await
		{
			error!("error forwarding response: {err}");
		}
	}
}

/// Routes upstream responses to the sink registered under their
/// MessageIDBeingRespondedTo.
#[derive(Default)]
pub struct ResponseRouter {
	sinks: Mutex<HashMap<US, Box<dyn DimseResponseSink>>>,
}

impl ResponseRouter {
	fn register(&self, message_id: US, sink: Box<dyn DimseResponseSink>) {
		self.sinks
			.lock()
			.expect("lock poisoned")
			.insert(message_id, sink);
	}

	async fn dispatch(&self, message: DicomMessage) {
		let Some(message_id) = message.command_int(tags::MESSAGE_ID_BEING_RESPONDED_TO) else {
			warn!("Upstream response without MessageIDBeingRespondedTo, dropping");
			return;
		};

		let sink = self.sinks.lock().expect("lock poisoned").remove(&message_id);
		match sink {
			Some(sink) => sink.on_response(message).await,
			None => warn!("No pending request for upstream response {message_id}"),
		}
	}
}

/// An upstream association with a reader task attached. Created by the
/// association layer when it decides to forward a peer directly instead of
/// spooling.
pub struct ForwardAssociation<F: Association> {
	upstream: F,
	router: ResponseRouter,
}

impl<F> ForwardAssociation<F>
where
	F: Association + Send + Sync + 'static,
{
	/// Wraps the upstream association and spawns the reader task that
	/// drives registered response sinks.
	pub fn new(upstream: F) -> Arc<Self> {
		let forward = Arc::new(Self {
			upstream,
			router: ResponseRouter::default(),
		});

		let reader = Arc::clone(&forward);
		tokio::spawn(async move {
			loop {
				match reader.upstream.read_message(Duration::MAX).await {
					Ok(message) => reader.router.dispatch(message).await,
					Err(err) => {
						debug!("Upstream association reader stopped: {err}");
						break;
					}
				}
			}
		});

		forward
	}

	/// Relays an N-CREATE-RQ/N-SET-RQ upstream. The sink is registered
	/// before the send so the response cannot outrun it; the call returns
	/// as soon as the request is on the wire.
	pub async fn relay(
		&self,
		dimse: Dimse,
		sop_class_uid: UI,
		sop_instance_uid: UI,
		message_id: US,
		data_set: Option<dicom::object::InMemDicomObject>,
		transfer_syntax_uid: &str,
		sink: Box<dyn DimseResponseSink>,
	) -> Result<(), ForwardError> {
		let presentation_context_id = self
			.upstream
			.presentation_contexts()
			.iter()
			.find(|pctx| pctx.transfer_syntax == transfer_syntax_uid)
			.map(|pctx| pctx.id);

		self.router.register(message_id, sink);

		let request = MppsRequest {
			dimse,
			sop_class_uid,
			sop_instance_uid,
			message_id,
			data_set,
		};
		self.upstream
			.write_message(request, presentation_context_id, RESPONSE_WRITE_TIMEOUT)
			.await?;

		Ok(())
	}
}
