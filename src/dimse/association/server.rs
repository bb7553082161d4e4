use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use crate::types::AE;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextResult;
use std::convert::identity;
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextResult>,
	calling_aet: AE,
	called_aet: AE,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	pub aet: AE,
	pub tcp_stream: TcpStream,
	pub uncompressed: bool,
}

impl ServerAssociation {
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(options.aet.clone())
			.promiscuous(true);

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (ready_tx, ready_rx) = oneshot::channel::<Result<_, AssociationError>>();

		let (command_tx, mut command_rx) = tokio::sync::mpsc::channel::<Command>(1);
		thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span =
					tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						let calling_aet = AE::from(association.client_ae_title());
						info!(
							calling_aet,
							called_aet = options.aet,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream::clone");

						ready_tx
							.send(Ok((stream, pcs, calling_aet, options.aet)))
							.map_err(|_value| ())?;
						association
					}
					Err(e) => {
						ready_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = command_rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							let send_result =
								association.send(&pdu).map_err(AssociationError::Server);
							response
								.send(send_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let receive_result =
								association.receive().map_err(AssociationError::Server);
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				command_rx.close();

				if let Err(e) = association.abort() {
					// Happens if the peer already closed the TCP stream.
					debug!("ServerAssociation.abort() returned error: {e}");
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_aet, called_aet) =
			ready_rx.await.expect("ready_rx.await")?;

		Ok(Self {
			channel: command_tx,
			presentation_contexts,
			calling_aet,
			called_aet,
			tcp_stream,
		})
	}

	/// AE title of the peer that opened this association.
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	/// AE title this association was accepted under.
	pub fn called_aet(&self) -> &str {
		&self.called_aet
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing accepted TcpStream from the handle side");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			warn!("Failed to shutdown accepted TcpStream: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextResult] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}
