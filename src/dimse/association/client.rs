use dicom::ul::pdu::{PDataValueType, PresentationContextResult};
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, Command};
use crate::types::{AE, UI};

/// Outgoing association towards an upstream peer, used to relay MPPS
/// requests while the accepting association stays open.
///
/// `dicom-ul` reads and writes blocking, so the PDU loop lives on its own
/// thread; this handle reaches it through the command channel and keeps a
/// clone of the socket so `close` can cut the connection from the async
/// side.
pub struct ClientAssociation {
	commands: Sender<Command>,
	id: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextResult>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: AE,
	pub called_aet: AE,
	pub abstract_syntax: UI,
	pub transfer_syntaxes: Vec<UI>,
	pub address: SocketAddr,
}

/// What the IO thread hands back once the A-ASSOCIATE handshake is done.
struct Negotiated {
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextResult>,
}

impl ClientAssociation {
	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let id = Uuid::new_v4();
		let address = options.address;
		let io_thread = format!("{}-scu", options.called_aet);

		let ul_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.with_presentation_context(options.abstract_syntax, options.transfer_syntaxes);

		let (command_tx, mut command_rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (ready_tx, ready_rx) = oneshot::channel::<Result<Negotiated, AssociationError>>();

		thread::Builder::new()
			.name(io_thread)
			.spawn(move || {
				let mut upstream = match ul_options.establish(address) {
					Ok(mut upstream) => {
						let negotiated = Negotiated {
							tcp_stream: upstream
								.inner_stream()
								.try_clone()
								.expect("TcpStream should be cloneable"),
							presentation_contexts: upstream.presentation_contexts().to_vec(),
						};
						if ready_tx.send(Ok(negotiated)).is_err() {
							return;
						}
						upstream
					}
					Err(err) => {
						warn!(
							upstream_id = id.to_string(),
							"Failed to establish upstream association: {err}"
						);
						let _ = ready_tx.send(Err(err.into()));
						return;
					}
				};

				while let Some(command) = command_rx.blocking_recv() {
					let delivered = match command {
						Command::Send(pdu, reply_to) => {
							reply_to.send(send_pdu(&mut upstream, &pdu)).is_ok()
						}
						Command::Receive(reply_to) => reply_to
							.send(upstream.receive().map_err(AssociationError::Client))
							.is_ok(),
					};
					if !delivered {
						// The requester stopped waiting for its reply; the
						// handle is on its way out, so stop serving.
						debug!(
							upstream_id = id.to_string(),
							"Requester gone, stopping upstream IO loop"
						);
						break;
					}
				}

				command_rx.close();
				if let Err(err) = upstream.abort() {
					debug!(
						upstream_id = id.to_string(),
						"Failed to abort upstream association: {err}"
					);
				}
			})
			.map_err(AssociationError::OsThread)?;

		let negotiated = ready_rx.await.expect("ready_rx.await")?;

		Ok(Self {
			commands: command_tx,
			id,
			tcp_stream: negotiated.tcp_stream,
			presentation_contexts: negotiated.presentation_contexts,
		})
	}
}

/// Sends one PDU upstream. A data set larger than the acceptor's maximum
/// PDU length is streamed through `send_pdata`, which splits it into
/// conforming chunks; everything else (including command sets, which are
/// tiny by construction) goes out as a single PDU.
fn send_pdu(
	upstream: &mut dicom::ul::ClientAssociation<TcpStream>,
	pdu: &Pdu,
) -> Result<(), AssociationError> {
	let Pdu::PData { data } = pdu else {
		return upstream.send(pdu).map_err(AssociationError::Client);
	};

	let payload: usize = data.iter().map(|pdv| pdv.data.len()).sum();
	let chunkable = data
		.iter()
		.all(|pdv| pdv.value_type == PDataValueType::Data);
	if !chunkable || payload <= upstream.acceptor_max_pdu_length() as usize {
		return upstream.send(pdu).map_err(AssociationError::Client);
	}

	for pdv in data {
		let mut writer = upstream.send_pdata(pdv.presentation_context_id);
		writer
			.write_all(&pdv.data)
			.map_err(AssociationError::ChunkWriter)?;
	}
	Ok(())
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.commands
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.commands
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				upstream_id = self.id.to_string(),
				"Failed to shutdown upstream TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextResult] {
		&self.presentation_contexts
	}
}
