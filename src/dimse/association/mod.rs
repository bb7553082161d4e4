use dicom::ul::pdu::PresentationContextResult;
use dicom::ul::Pdu;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

pub mod client;
pub mod server;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn thread")]
	OsThread(std::io::Error),
	#[error("Failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error(transparent)]
	Server(#[from] dicom::ul::association::server::Error),
	#[error(transparent)]
	Client(#[from] dicom::ul::association::client::Error),
}

pub trait Association {
	fn receive(
		&self,
		timeout: Duration,
	) -> impl Future<Output = Result<Pdu, AssociationError>> + Send;

	fn send(
		&self,
		pdu: Pdu,
		timeout: Duration,
	) -> impl Future<Output = Result<(), AssociationError>> + Send;

	fn close(&mut self);

	fn presentation_contexts(&self) -> &[PresentationContextResult];
}

/// Requests served by an association's IO thread. Each carries the
/// oneshot slot the reply is delivered through.
#[derive(Debug)]
pub enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

/// Request/response over an mpsc channel: enqueue a command carrying a
/// fresh oneshot sender, then await that oneshot under a timeout.
pub trait AskPattern<T> {
	fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T + Send,
		timeout: Duration,
	) -> impl Future<Output = Result<R, ChannelError>> + Send
	where
		R: Send;
}

impl<T: Send> AskPattern<T> for Sender<T> {
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<R>) -> T + Send,
		timeout: Duration,
	) -> Result<R, ChannelError>
	where
		R: Send,
	{
		let (tx, rx) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.send(command(tx))
				.await
				.map_err(|_| ChannelError::Closed)?;

			rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
	}
}

#[cfg(test)]
pub mod testing {
	use super::{Association, AssociationError, ChannelError};
	use dicom::ul::pdu::{PresentationContextResult, PresentationContextResultReason};
	use dicom::ul::Pdu;
	use std::time::Duration;
	use tokio::sync::mpsc;
	use tokio::sync::Mutex as AsyncMutex;

	/// In-memory association: sent PDUs land in a channel the test can
	/// drain, received PDUs are fed in by the test.
	pub struct StubAssociation {
		sent: mpsc::UnboundedSender<Pdu>,
		incoming: AsyncMutex<mpsc::UnboundedReceiver<Pdu>>,
		presentation_contexts: Vec<PresentationContextResult>,
	}

	impl StubAssociation {
		pub fn pair(
			transfer_syntax: &str,
		) -> (
			Self,
			mpsc::UnboundedReceiver<Pdu>,
			mpsc::UnboundedSender<Pdu>,
		) {
			let (sent_tx, sent_rx) = mpsc::unbounded_channel();
			let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
			let stub = Self {
				sent: sent_tx,
				incoming: AsyncMutex::new(incoming_rx),
				presentation_contexts: vec![PresentationContextResult {
					id: 1,
					reason: PresentationContextResultReason::Acceptance,
					transfer_syntax: String::from(transfer_syntax),
				}],
			};
			(stub, sent_rx, incoming_tx)
		}
	}

	impl Association for StubAssociation {
		async fn receive(&self, _timeout: Duration) -> Result<Pdu, AssociationError> {
			self.incoming
				.lock()
				.await
				.recv()
				.await
				.ok_or(AssociationError::Channel(ChannelError::Closed))
		}

		async fn send(&self, pdu: Pdu, _timeout: Duration) -> Result<(), AssociationError> {
			self.sent
				.send(pdu)
				.map_err(|_| AssociationError::Channel(ChannelError::Closed))
		}

		fn close(&mut self) {}

		fn presentation_contexts(&self) -> &[PresentationContextResult] {
			&self.presentation_contexts
		}
	}
}
