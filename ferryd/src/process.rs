use std::sync::Arc;

use ferry::{
	alias::AliasDescriptor,
	directory::admin_emails,
	envelope::Envelope,
	headers::list_headers,
	pipeline::{Absorbed, Delivery, Failure, Pipeline, Rejection, RelayState, Verdict},
};
use hickory_resolver::TokioAsyncResolver;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};
use tokio::sync::{mpsc, watch};

use crate::{
	archive::{ArchiveEntry, FsArchive},
	binconfig::BinConfig,
	dirfile::FileDirectory,
	dmarc, relay,
};

/// Takes finished envelopes off the channel, runs the pipeline, and
/// acts on the verdict: relay, archive, or both.
pub struct Processor {
	config: Arc<BinConfig>,
	directory: Arc<FileDirectory>,
	archive: FsArchive,
	resolver: TokioAsyncResolver,
	state: RelayState,
}

impl Processor {
	pub fn new(
		config: Arc<BinConfig>,
		directory: Arc<FileDirectory>,
		archive: FsArchive,
		resolver: TokioAsyncResolver,
	) -> Self {
		Self {
			config,
			directory,
			archive,
			resolver,
			state: RelayState::new(),
		}
	}

	pub async fn run(
		self,
		mut receiver: mpsc::UnboundedReceiver<Envelope>,
		mut rx: watch::Receiver<bool>,
	) {
		loop {
			let envelope = tokio::select! {
				_ = rx.changed() => break,
				Some(envelope) = receiver.recv() => envelope,
			};

			self.handle(envelope).await;
		}
	}

	async fn handle(&self, mut envelope: Envelope) {
		// The pipeline itself never touches the network, so the DMARC
		// policy is looked up here first.
		if self.config.core.enforce_dmarc {
			if let Some(domain) = envelope.from_domain() {
				envelope.strict_dmarc_policy =
					dmarc::domain_is_strict(&self.resolver, &domain).await;
			}
		}

		let pipeline = Pipeline::new(&self.config.core, self.directory.as_ref(), &self.state);

		match pipeline.decide(&mut envelope) {
			Verdict::Accept(deliveries) => self.deliver(&envelope, deliveries).await,
			Verdict::Reject(rejection) => self.reject(&envelope, rejection),
			Verdict::Absorbed(absorbed) => self.absorb(&envelope, absorbed),
			Verdict::Failed(failure) => self.fail(&envelope, failure).await,
		}
	}

	async fn deliver(&self, envelope: &Envelope, deliveries: Vec<Delivery>) {
		for delivery in deliveries {
			let data = envelope.message.with_headers(&delivery.headers);
			let result = relay::send(
				&self.config.relay_address,
				self.config.relay_port,
				&self.config.hostname,
				&self.config.core.sender,
				&delivery.recipients,
				&data,
			)
			.await;

			let recipients = self
				.state
				.abbreviate_log_line(delivery.recipients.join(", "));

			match result {
				Ok(()) => tracing::info!("delivered {} to {}", delivery.descriptor, recipients),
				Err(error) => {
					tracing::error!(
						"relay of {} to {} failed: {}",
						delivery.descriptor,
						recipients,
						error
					);
					self.store(
						envelope,
						&format!("relay failed: {}", error),
						&format!("could not hand the {} copy upstream: {}", delivery.descriptor, error),
					);
				}
			}
		}
	}

	fn reject(&self, envelope: &Envelope, rejection: Rejection) {
		self.store(
			envelope,
			&rejection.reason,
			&format!("rejected: {}", rejection.reason),
		);
	}

	fn absorb(&self, envelope: &Envelope, absorbed: Absorbed) {
		let entry = ArchiveEntry {
			mailfrom: absorbed.original_sender,
			rcpttos: absorbed.original_recipients,
			subject: absorbed.original_subject,
			date: absorbed.original_date,
			summary: absorbed.notification.clone(),
			report: Some(absorbed.report),
			description: absorbed.notification,
		};

		match self.archive.store(&entry, envelope.message.as_bytes()) {
			Ok(stamp) => tracing::info!("archived delivery report as {}", stamp),
			Err(error) => tracing::error!("could not archive delivery report: {}", error),
		}
	}

	async fn fail(&self, envelope: &Envelope, failure: Failure) {
		self.store(envelope, &failure.summary, &failure.description);

		if failure.alert {
			self.alert(&failure).await;
		}
	}

	fn store(&self, envelope: &Envelope, summary: &str, description: &str) {
		let entry = ArchiveEntry {
			mailfrom: envelope.sender_string(),
			rcpttos: envelope.recipients.iter().map(ToString::to_string).collect(),
			subject: envelope.message.get_header("Subject"),
			date: envelope.message.get_header("Date"),
			summary: summary.to_string(),
			report: None,
			description: description.to_string(),
		};

		match self.archive.store(&entry, envelope.message.as_bytes()) {
			Ok(stamp) => tracing::info!("archived as {}: {}", stamp, summary),
			Err(error) => tracing::error!("could not archive ({}): {}", summary, error),
		}
	}

	/// Mail the administrators about the first occurrence of a failure
	/// kind. The alert carries its own list headers so autoresponders
	/// leave us alone.
	async fn alert(&self, failure: &Failure) {
		let core = &self.config.core;
		let admins = admin_emails(self.directory.as_ref(), core);
		if admins.is_empty() {
			tracing::error!("nowhere to send the alert: no administrator addresses");
			return;
		}

		let date = match OffsetDateTime::now_utc().format(&Rfc2822) {
			Ok(date) => date,
			Err(error) => {
				tracing::error!("could not format the alert date: {}", error);
				return;
			}
		};

		let descriptor = AliasDescriptor::Group {
			name: "ferryerror".to_string(),
		};

		let mut mail = format!(
			"From: {}\r\nTo: {}\r\nSubject: ferryd failure: {}\r\nDate: {}\r\n",
			core.sender,
			admins.join(", "),
			failure.summary,
			date,
		);
		for (name, value) in list_headers(&core.sender, &core.domain, &descriptor) {
			mail.push_str(&format!("{}: {}\r\n", name, value));
		}
		mail.push_str("\r\n");
		mail.push_str(&failure.description);
		mail.push_str("\r\n");

		let result = relay::send(
			&self.config.relay_address,
			self.config.relay_port,
			&self.config.hostname,
			&core.sender,
			&admins,
			mail.as_bytes(),
		)
		.await;

		match result {
			Ok(()) => tracing::info!("alerted {} about: {}", admins.join(", "), failure.summary),
			Err(error) => tracing::error!("could not send the alert: {}", error),
		}
	}
}
