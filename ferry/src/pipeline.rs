//! The decision core: one envelope in, one verdict out. The checks run
//! in a fixed order, and everything here is synchronous and free of
//! I/O; the daemon owns the sockets and the archive.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{Mutex, OnceLock, PoisonError},
};

use regex::Regex;
use thiserror::Error;

use crate::{
	alias::{self, AliasDescriptor, ResolveError},
	config::Config,
	directory::{DirectoryError, DirectorySnapshot, UserId},
	envelope::Envelope,
	headers,
	message::Message,
	report::{self, DeliveryReport, ReportError},
};

/// One outbound copy of an accepted message: the alias that produced
/// it, the mailboxes it goes to, and the list headers to prepend.
#[derive(Clone, Debug)]
pub struct Delivery {
	pub descriptor: AliasDescriptor,
	pub recipients: Vec<String>,
	pub headers: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct Rejection {
	pub reason: String,
}

/// A delivery report we consumed instead of forwarding. Carries the
/// undelivered message's own envelope data so the archive entry is
/// filed under the mail that actually failed.
#[derive(Clone, Debug)]
pub struct Absorbed {
	pub notification: String,
	pub original_sender: String,
	pub original_recipients: Vec<String>,
	pub original_subject: Option<String>,
	pub original_date: Option<String>,
	/// The structured records, so the archive keeps more than prose.
	pub report: DeliveryReport,
}

/// An internal failure while deciding. `alert` is set on the first
/// occurrence of each failure kind per process, so a directory outage
/// pages the administrators once rather than once per message.
#[derive(Clone, Debug)]
pub struct Failure {
	pub summary: String,
	pub description: String,
	pub alert: bool,
}

#[derive(Clone, Debug)]
pub enum Verdict {
	Accept(Vec<Delivery>),
	Reject(Rejection),
	Absorbed(Absorbed),
	Failed(Failure),
}

#[derive(Error, Debug)]
pub enum PipelineError {
	#[error(transparent)]
	Directory(#[from] DirectoryError),
	#[error("delivery report parsing failed: {0}")]
	Report(#[from] ReportError),
	#[error("alias resolution failed: {0}")]
	Resolve(ResolveError),
	#[error("whitespace-damaged References and more than one References header")]
	AmbiguousReferences,
}

impl PipelineError {
	/// Where it failed and what kind of failure; the alert
	/// deduplication key.
	pub fn key(&self) -> (&'static str, &'static str) {
		match self {
			Self::Directory(_) => ("directory", "Lookup"),
			Self::Report(error) => ("report", report_kind(error)),
			Self::Resolve(error) => ("resolve", resolve_kind(error)),
			Self::AmbiguousReferences => ("fix_references", "AmbiguousReferences"),
		}
	}
}

fn report_kind(error: &ReportError) -> &'static str {
	match error {
		ReportError::Mime(_) => "Mime",
		ReportError::PartCount(_) => "PartCount",
		ReportError::PartType(_) => "PartType",
		ReportError::MissingField(_) => "MissingField",
		ReportError::Untyped(_) => "Untyped",
		ReportError::BadReportingMta(_) => "BadReportingMta",
		ReportError::BadFinalRecipient(_) => "BadFinalRecipient",
		ReportError::BadAction(_) => "BadAction",
		ReportError::BadStatus(_) => "BadStatus",
		ReportError::NoRecipients => "NoRecipients",
	}
}

fn resolve_kind(error: &ResolveError) -> &'static str {
	match error {
		ResolveError::InvalidRecipient(_) => "InvalidRecipient",
		ResolveError::AmbiguousAlias(_) => "AmbiguousAlias",
		ResolveError::BadGroupPattern { .. } => "BadGroupPattern",
		ResolveError::Directory(_) => "Lookup",
	}
}

/// Mutable per-process state shared across envelopes: which failure
/// kinds have already alerted, and which long recipient lists were
/// logged recently.
#[derive(Default)]
pub struct RelayState {
	seen_errors: Mutex<HashSet<(String, String)>>,
	recent: Mutex<RecentRecipients>,
}

#[derive(Default)]
struct RecentRecipients {
	delivered: u64,
	last_logged: HashMap<String, u64>,
}

impl RelayState {
	pub fn new() -> Self {
		Self::default()
	}

	/// True the first time this (site, kind) pair is seen.
	pub fn first_occurrence(&self, site: &str, kind: &str) -> bool {
		self.seen_errors
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert((site.to_string(), kind.to_string()))
	}

	/// Keep delivery log lines readable when the same huge recipient
	/// list goes out over and over. The first sighting is logged in
	/// full and tagged with the running delivery counter; for the next
	/// 40 deliveries the list is cut down to a reference to that tag.
	pub fn abbreviate_log_line(&self, recipients: String) -> String {
		let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);

		let line = if recipients.len() > 200 {
			match recent.last_logged.get(&recipients) {
				Some(&tag) if recent.delivered - tag <= 40 => {
					format!("{}... [{}]", truncate_boundary(&recipients, 197), tag)
				}
				_ => {
					let tag = recent.delivered;
					recent.last_logged.insert(recipients.clone(), tag);
					format!("{} [{}]", recipients, tag)
				}
			}
		} else {
			recipients
		};

		recent.delivered += 1;
		line
	}
}

fn truncate_boundary(text: &str, mut end: usize) -> &str {
	while !text.is_char_boundary(end) {
		end -= 1;
	}
	&text[..end]
}

/// Recover the original sender from an SRS-rewritten address like
/// `SRS0=hash=tt=orig-domain=orig-local@forwarder`. Anything that
/// doesn't look like SRS comes back unchanged.
pub fn srs_decode(sender: &str) -> String {
	let trimmed = sender.trim();
	let bare = match trimmed.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
		Some(inner) => inner.trim(),
		None => trimmed,
	};

	let local = match bare.rsplit_once('@') {
		Some((local, _)) => local,
		None => return sender.to_string(),
	};
	if !local.to_uppercase().starts_with("SRS") {
		return sender.to_string();
	}

	let parts: Vec<&str> = local.split('=').collect();
	if parts.len() < 3 {
		return sender.to_string();
	}

	format!("{}@{}", parts[parts.len() - 1], parts[parts.len() - 2])
}

pub struct Pipeline<'a> {
	config: &'a Config,
	directory: &'a dyn DirectorySnapshot,
	state: &'a RelayState,
}

impl<'a> Pipeline<'a> {
	pub fn new(
		config: &'a Config,
		directory: &'a dyn DirectorySnapshot,
		state: &'a RelayState,
	) -> Self {
		Self {
			config,
			directory,
			state,
		}
	}

	/// Decide what to do with an envelope. Internal failures never
	/// escape; they become a [`Verdict::Failed`] the daemon archives.
	pub fn decide(&self, envelope: &mut Envelope) -> Verdict {
		match self.run(envelope) {
			Ok(verdict) => verdict,
			Err(error) => {
				let (site, kind) = error.key();
				let alert = self.state.first_occurrence(site, kind);
				tracing::error!("failure in {}: {}", site, error);

				Verdict::Failed(Failure {
					summary: format!("{}: {}", kind, error),
					description: format!("failure in {} while handling mail from {}: {}", site, envelope.sender_string(), error),
					alert,
				})
			}
		}
	}

	fn run(&self, envelope: &mut Envelope) -> Result<Verdict, PipelineError> {
		if let Some(absorbed) = self.absorb_delivery_report(envelope)? {
			return Ok(Verdict::Absorbed(absorbed));
		}

		if let Some(reason) = self.reject(envelope).or_else(|| self.authorize(envelope)) {
			tracing::info!("rejected mail from {}: {}", envelope.sender_string(), reason);
			return Ok(Verdict::Reject(Rejection { reason }));
		}

		self.fix_references(&mut envelope.message)?;
		self.accept(envelope)
	}

	/// Bounces for mail we relayed come back to the admin alias with a
	/// null reverse-path. Those are consumed here, logged as a short
	/// notification, and never forwarded.
	fn absorb_delivery_report(
		&self,
		envelope: &Envelope,
	) -> Result<Option<Absorbed>, PipelineError> {
		if !envelope.reverse_path.is_null() || !envelope.is_to_admin_only(self.config) {
			return Ok(None);
		}

		let report = match report::parse_delivery_report(&envelope.message, self.config)? {
			Some(report) => report,
			None => return Ok(None),
		};

		tracing::info!("{}", report.notification);

		Ok(Some(Absorbed {
			original_sender: report
				.original_sender
				.clone()
				.unwrap_or_else(|| "(unknown)".to_string()),
			original_recipients: report.original_recipients.clone(),
			original_subject: report.original_subject.clone(),
			original_date: report.original_date.clone(),
			notification: report.notification.clone(),
			report,
		}))
	}

	fn reject(&self, envelope: &Envelope) -> Option<String> {
		let content_type = envelope.message.content_type();
		if content_type.starts_with("multipart/report")
			&& content_type.contains("report-type=delivery-status")
		{
			// a report that wasn't absorbed above is not one of ours
			return Some("Content-Type looks like a DSN".to_string());
		}

		if envelope.is_to_admin_only(self.config) {
			let subject = envelope.message.subject();
			if subject.contains("Delayed Mail")
				|| subject.contains("Undelivered Mail Returned to Sender")
			{
				return Some("Subject looks like a DSN".to_string());
			}
		}

		if envelope.message.has_unknown_charset() {
			return Some("invalid header encoding".to_string());
		}

		if envelope.reverse_path.is_null() {
			// forwarding would have to invent a reverse-path
			return Some("null reverse-path".to_string());
		}

		let from_count = envelope.message.get_all_headers("From").len();
		if from_count != 1 {
			return Some(format!("wrong number of From-headers ({})", from_count));
		}
		let from_domain = match envelope.from_domain() {
			Some(domain) => domain,
			None => return Some("invalid From-header".to_string()),
		};

		if self.config.enforce_dmarc
			&& envelope.strict_dmarc_policy
			&& envelope.message.get_all_headers("DKIM-Signature").is_empty()
		{
			return Some(format!(
				"{} has strict DMARC policy, but message has no DKIM-Signature header",
				from_domain
			));
		}

		None
	}

	fn authorize(&self, envelope: &Envelope) -> Option<String> {
		let from_domain = envelope.from_domain()?.to_lowercase();

		for recipient in &envelope.recipients {
			if !recipient.domain.is(&self.config.domain) {
				continue;
			}

			// poor man's spam filter
			if !from_domain.ends_with(".com") && !from_domain.ends_with(".dk") {
				tracing::info!(
					"spam filter: From domain {} ({} -> {})",
					from_domain,
					envelope.sender_string(),
					recipient
				);
				return Some("spam filter triggered".to_string());
			}

			let sender = srs_decode(&envelope.sender_string());
			if !self.sender_authorized(&sender, recipient.local_part.as_str()) {
				tracing::info!(
					"unauthorized sender {} for list {}",
					sender,
					recipient.local_part
				);
				return Some("sender not authorized for internal-only list".to_string());
			}
		}

		None
	}

	/// Membership check for internal-only lists. Own-domain senders are
	/// always allowed. Fails open: a directory that can't answer lets
	/// the mail through.
	fn sender_authorized(&self, sender: &str, list_name: &str) -> bool {
		let own = format!("@{}", self.config.domain.to_lowercase());
		if sender.to_lowercase().contains(&own) {
			return true;
		}

		let list = match self.directory.internal_list(list_name) {
			Ok(Some(list)) => list,
			Ok(None) => return true,
			Err(error) => {
				tracing::warn!("list lookup failed, allowing {}: {}", sender, error);
				return true;
			}
		};

		match self.directory.is_list_member(sender, list) {
			Ok(member) => member,
			Err(error) => {
				tracing::warn!("membership lookup failed, allowing {}: {}", sender, error);
				true
			}
		}
	}

	/// Some clients break References into a new line *inside* an angle
	/// bracket pair, which then gets unfolded into an id with embedded
	/// whitespace. Move the whitespace back in front of the `<` and
	/// refold. Only safe when the message has exactly one References
	/// header to rewrite.
	fn fix_references(&self, message: &mut Message) -> Result<(), PipelineError> {
		static RE: OnceLock<Regex> = OnceLock::new();
		let re = RE.get_or_init(|| Regex::new(r"(<[^<> \t\r\n]*)([ \t\r\n]+)").unwrap());

		let originals = message.get_all_headers("References");
		let fixed: Vec<String> = originals
			.iter()
			.map(|value| {
				let moved = re.replace_all(value, "$2$1");
				if moved != value.as_str() {
					moved.split_whitespace().collect::<Vec<_>>().join("\r\n ")
				} else {
					value.clone()
				}
			})
			.collect();

		if fixed == originals {
			return Ok(());
		}
		if fixed.len() != 1 {
			return Err(PipelineError::AmbiguousReferences);
		}

		tracing::info!("repaired a whitespace-damaged References header");
		message.set_unique_header("References", &fixed[0]);
		Ok(())
	}

	/// Resolve every recipient and fold the results into one delivery
	/// plan. The same person reached through two recipients gets one
	/// copy, owned by the later recipient's descriptor.
	fn accept(&self, envelope: &Envelope) -> Result<Verdict, PipelineError> {
		let mut members: BTreeMap<UserId, AliasDescriptor> = BTreeMap::new();
		let mut invalid = vec![];

		for recipient in &envelope.recipients {
			match alias::resolve(recipient.local_part.as_str(), self.directory) {
				Ok(resolution) => {
					for (id, descriptor) in resolution.members() {
						members.insert(id, descriptor.clone());
					}
				}
				Err(ResolveError::InvalidRecipient(tokens)) => invalid.extend(tokens),
				Err(error) => return Err(PipelineError::Resolve(error)),
			}
		}

		if !invalid.is_empty() {
			return Ok(Verdict::Reject(Rejection {
				reason: format!("invalid recipient: {}", invalid.join(", ")),
			}));
		}

		let mut by_descriptor: BTreeMap<AliasDescriptor, Vec<UserId>> = BTreeMap::new();
		for (id, descriptor) in members {
			by_descriptor.entry(descriptor).or_default().push(id);
		}

		let mut deliveries = vec![];
		for (descriptor, ids) in by_descriptor {
			let recipients = self.directory.email_addresses(&ids)?;
			if recipients.is_empty() {
				// everyone in this group refuses direct mail
				continue;
			}

			let headers =
				headers::list_headers(&self.config.sender, &self.config.domain, &descriptor);
			deliveries.push(Delivery {
				descriptor,
				recipients,
				headers,
			});
		}

		if deliveries.is_empty() {
			return Ok(Verdict::Reject(Rejection {
				reason: "invalid recipient: no deliverable addresses".to_string(),
			}));
		}

		Ok(Verdict::Accept(deliveries))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{
		alias::PeriodKind,
		config::test_config,
		directory::{stub::StubDirectory, DirectoryError, GroupDef, ListId},
	};

	const PLAIN: &[u8] = b"From: friend@sender.example.com\r\nSubject: hi\r\n\r\nhello\r\n";

	fn envelope(sender: &str, recipients: &[&str], raw: &[u8]) -> Envelope {
		Envelope::new(
			sender.parse().unwrap(),
			recipients.iter().map(|r| r.parse().unwrap()).collect(),
			Message::new(raw.to_vec()),
		)
	}

	fn decide(directory: &StubDirectory, envelope: &mut Envelope) -> Verdict {
		let config = test_config();
		let state = RelayState::new();
		Pipeline::new(&config, directory, &state).decide(envelope)
	}

	fn reason(verdict: Verdict) -> String {
		match verdict {
			Verdict::Reject(rejection) => rejection.reason,
			other => panic!("expected rejection, got {:?}", other),
		}
	}

	fn dsn_raw() -> Vec<u8> {
		concat!(
			"From: Mail Delivery System <MAILER-DAEMON@relay.example.dk>\r\n",
			"To: admin@example.dk\r\n",
			"Subject: Undelivered Mail Returned to Sender\r\n",
			"Content-Type: multipart/report; report-type=delivery-status; boundary=\"FEDCBA\"\r\n",
			"\r\n",
			"--FEDCBA\r\n",
			"Content-Type: text/plain\r\n",
			"\r\n",
			"This is the mail system at host relay.example.dk.\r\n",
			"--FEDCBA\r\n",
			"Content-Type: message/delivery-status\r\n",
			"\r\n",
			"Reporting-MTA: dns; relay.example.dk\r\n",
			"\r\n",
			"Final-Recipient: rfc822; gone@gmail.com\r\n",
			"Action: failed\r\n",
			"Status: 5.1.1\r\n",
			"Remote-MTA: dns; gmail-smtp-in.l.google.com\r\n",
			"Diagnostic-Code: smtp; 550-5.1.1 The email account that you tried to reach \
				does not exist. Please try 550-5.1.1 double-checking the recipient's \
				email address for typos or 550-5.1.1 unnecessary spaces.\r\n",
			"\r\n",
			"--FEDCBA\r\n",
			"Content-Type: message/rfc822\r\n",
			"\r\n",
			"Return-Path: <someone@sender.example.com>\r\n",
			"Subject: hello\r\n",
			"Date: Mon, 1 Apr 2013 10:00:00 +0200\r\n",
			"\r\n",
			"hi\r\n",
			"--FEDCBA--\r\n",
		)
		.as_bytes()
		.to_vec()
	}

	#[test]
	fn bounce_to_admin_is_absorbed() {
		let directory = StubDirectory::new();
		let mut envelope = envelope("<>", &["admin@example.dk"], &dsn_raw());

		match decide(&directory, &mut envelope) {
			Verdict::Absorbed(absorbed) => {
				assert_eq!(absorbed.notification, "<gone@gmail.com>: No such user");
				assert_eq!(absorbed.original_sender, "someone@sender.example.com");
				assert_eq!(absorbed.original_recipients, vec!["gone@gmail.com"]);
				assert_eq!(absorbed.original_subject.as_deref(), Some("hello"));
			}
			other => panic!("expected absorption, got {:?}", other),
		}
	}

	#[test]
	fn bounce_shaped_mail_to_a_list_is_rejected() {
		let directory = StubDirectory::new();
		let mut envelope = envelope("<x@sender.example.com>", &["FORM@example.dk"], &dsn_raw());

		assert_eq!(
			reason(decide(&directory, &mut envelope)),
			"Content-Type looks like a DSN"
		);
	}

	#[test]
	fn bounce_shaped_subject_to_admin_is_rejected() {
		let directory = StubDirectory::new();
		let raw = b"From: x@sender.example.com\r\nSubject: Delayed Mail (still trying)\r\n\r\n.\r\n";
		let mut envelope = envelope("<x@sender.example.com>", &["admin@example.dk"], raw);

		assert_eq!(
			reason(decide(&directory, &mut envelope)),
			"Subject looks like a DSN"
		);
	}

	#[test]
	fn null_reverse_path_to_a_list_is_rejected() {
		let directory = StubDirectory::new();
		let mut envelope = envelope("<>", &["FORM@example.dk"], PLAIN);

		assert_eq!(reason(decide(&directory, &mut envelope)), "null reverse-path");
	}

	#[test]
	fn raw_8bit_headers_are_rejected() {
		let directory = StubDirectory::new();
		let mut raw = b"From: a@sender.example.com\r\nSubject: h".to_vec();
		raw.push(0x80);
		raw.extend_from_slice(b"i\r\n\r\n.\r\n");
		let mut envelope = envelope("<a@sender.example.com>", &["FORM@example.dk"], &raw);

		assert_eq!(
			reason(decide(&directory, &mut envelope)),
			"invalid header encoding"
		);
	}

	#[test]
	fn from_header_count_is_enforced() {
		let directory = StubDirectory::new();

		let raw = b"From: a@x.com\r\nFrom: b@y.com\r\nSubject: s\r\n\r\n.\r\n";
		let mut two = envelope("<a@x.com>", &["FORM@example.dk"], raw);
		assert_eq!(
			reason(decide(&directory, &mut two)),
			"wrong number of From-headers (2)"
		);

		let raw = b"Subject: s\r\n\r\n.\r\n";
		let mut none = envelope("<a@x.com>", &["FORM@example.dk"], raw);
		assert_eq!(
			reason(decide(&directory, &mut none)),
			"wrong number of From-headers (0)"
		);

		let raw = b"From: undisclosed-recipients\r\nSubject: s\r\n\r\n.\r\n";
		let mut bare = envelope("<a@x.com>", &["FORM@example.dk"], raw);
		assert_eq!(reason(decide(&directory, &mut bare)), "invalid From-header");
	}

	#[test]
	fn strict_dmarc_without_dkim_is_rejected_when_enforced() {
		let directory = StubDirectory::new();
		let state = RelayState::new();
		let mut config = test_config();
		config.enforce_dmarc = true;

		let raw = b"From: a@strict.example.com\r\nSubject: s\r\n\r\n.\r\n";
		let mut unsigned = envelope("<a@strict.example.com>", &["FORM@example.dk"], raw);
		unsigned.strict_dmarc_policy = true;

		let verdict = Pipeline::new(&config, &directory, &state).decide(&mut unsigned);
		assert_eq!(
			reason(verdict),
			"strict.example.com has strict DMARC policy, but message has no DKIM-Signature header"
		);

		let raw =
			b"From: a@strict.example.com\r\nDKIM-Signature: v=1; d=strict.example.com; b=xyz\r\nSubject: s\r\n\r\n.\r\n";
		let mut signed = envelope("<a@strict.example.com>", &["FORM@example.dk"], raw);
		signed.strict_dmarc_policy = true;

		let verdict = Pipeline::new(&config, &directory, &state).decide(&mut signed);
		assert!(matches!(verdict, Verdict::Accept(_)));
	}

	#[test]
	fn strict_dmarc_is_ignored_by_default() {
		let directory = StubDirectory::new();
		let mut envelope = envelope("<a@strict.example.com>", &["FORM@example.dk"], PLAIN);
		envelope.strict_dmarc_policy = true;

		assert!(matches!(
			decide(&directory, &mut envelope),
			Verdict::Accept(_)
		));
	}

	#[test]
	fn spam_filter_wants_com_or_dk_from_domains() {
		let directory = StubDirectory::new();

		let raw = b"From: a@shady.example.net\r\nSubject: s\r\n\r\n.\r\n";
		let mut shady = envelope("<a@shady.example.net>", &["FORM@example.dk"], raw);
		assert_eq!(
			reason(decide(&directory, &mut shady)),
			"spam filter triggered"
		);

		let mut fine = envelope("<friend@sender.example.com>", &["FORM@example.dk"], PLAIN);
		assert!(matches!(decide(&directory, &mut fine), Verdict::Accept(_)));
	}

	fn directory_with_internal_list() -> StubDirectory {
		let mut directory = StubDirectory::new();
		directory.add_group(5, "hemmelig", "HEMMELIG", &[3]);
		directory.internal_lists.insert(
			"hemmelig".to_string(),
			(7, vec!["boss@member.example.com".to_string()]),
		);
		directory
	}

	#[test]
	fn internal_lists_reject_strangers() {
		let directory = directory_with_internal_list();
		let raw = b"From: rando@gmail.com\r\nSubject: s\r\n\r\n.\r\n";
		let mut envelope = envelope("<rando@gmail.com>", &["hemmelig@example.dk"], raw);

		assert_eq!(
			reason(decide(&directory, &mut envelope)),
			"sender not authorized for internal-only list"
		);
	}

	#[test]
	fn internal_lists_allow_members_and_own_domain() {
		let directory = directory_with_internal_list();
		let raw = b"From: boss@member.example.com\r\nSubject: s\r\n\r\n.\r\n";

		let mut member = envelope("<boss@member.example.com>", &["hemmelig@example.dk"], raw);
		assert!(matches!(decide(&directory, &mut member), Verdict::Accept(_)));

		let raw = b"From: user2@sender.example.com\r\nSubject: s\r\n\r\n.\r\n";
		let mut own = envelope("<someone@example.dk>", &["hemmelig@example.dk"], raw);
		assert!(matches!(decide(&directory, &mut own), Verdict::Accept(_)));
	}

	#[test]
	fn srs_senders_are_decoded_before_the_membership_check() {
		let directory = directory_with_internal_list();
		let raw = b"From: boss@member.example.com\r\nSubject: s\r\n\r\n.\r\n";
		let mut envelope = envelope(
			"<SRS0=xyz=12=member.example.com=boss@forward.example.net>",
			&["hemmelig@example.dk"],
			raw,
		);

		assert!(matches!(
			decide(&directory, &mut envelope),
			Verdict::Accept(_)
		));
	}

	#[test]
	fn srs_decoding() {
		assert_eq!(
			srs_decode("SRS0=xyz=12=gmail.com=joe@forward.example.net"),
			"joe@gmail.com"
		);
		assert_eq!(
			srs_decode(" <srs0=a=b=one.com=two@forward.example.net> "),
			"two@one.com"
		);
		assert_eq!(srs_decode("joe@gmail.com"), "joe@gmail.com");
		assert_eq!(srs_decode("SRS0=broken@x.com"), "SRS0=broken@x.com");
		assert_eq!(srs_decode("no-at-sign"), "no-at-sign");
	}

	/// Membership lookups failing must not block mail.
	struct DownDirectory(StubDirectory);

	impl DirectorySnapshot for DownDirectory {
		fn groups(&self) -> Result<Vec<GroupDef>, DirectoryError> {
			self.0.groups()
		}
		fn group_members(&self, id: u64) -> Result<Vec<UserId>, DirectoryError> {
			self.0.group_members(id)
		}
		fn title_roots(&self) -> Result<Vec<String>, DirectoryError> {
			self.0.title_roots()
		}
		fn users_by_title(&self, root: &str, period: i32) -> Result<Vec<UserId>, DirectoryError> {
			self.0.users_by_title(root, period)
		}
		fn period_members(
			&self,
			kind: PeriodKind,
			period: i32,
		) -> Result<Vec<UserId>, DirectoryError> {
			self.0.period_members(kind, period)
		}
		fn user_exists(&self, id: UserId) -> Result<bool, DirectoryError> {
			self.0.user_exists(id)
		}
		fn email_addresses(&self, ids: &[UserId]) -> Result<Vec<String>, DirectoryError> {
			self.0.email_addresses(ids)
		}
		fn internal_list(&self, _name: &str) -> Result<Option<ListId>, DirectoryError> {
			Err(DirectoryError::Lookup("database is down".to_string()))
		}
		fn is_list_member(&self, _address: &str, _list: ListId) -> Result<bool, DirectoryError> {
			Err(DirectoryError::Lookup("database is down".to_string()))
		}
		fn admin_emails(&self) -> Result<Vec<String>, DirectoryError> {
			self.0.admin_emails()
		}
		fn current_period(&self) -> i32 {
			self.0.current_period()
		}
	}

	#[test]
	fn membership_checks_fail_open() {
		let directory = DownDirectory(directory_with_internal_list());
		let config = test_config();
		let state = RelayState::new();
		let raw = b"From: rando@gmail.com\r\nSubject: s\r\n\r\n.\r\n";
		let mut envelope = envelope("<rando@gmail.com>", &["hemmelig@example.dk"], raw);

		let verdict = Pipeline::new(&config, &directory, &state).decide(&mut envelope);
		assert!(matches!(verdict, Verdict::Accept(_)));
	}

	#[test]
	fn damaged_references_are_repaired() {
		let directory = StubDirectory::new();
		let raw = b"From: friend@sender.example.com\r\nReferences: <aaa@x> <bbb\r\n @y>\r\nSubject: hi\r\n\r\nhello\r\n";
		let mut envelope = envelope("<friend@sender.example.com>", &["FORM@example.dk"], raw);

		assert!(matches!(
			decide(&directory, &mut envelope),
			Verdict::Accept(_)
		));
		assert_eq!(
			envelope.message.get_all_headers("References"),
			vec!["<aaa@x> <bbb@y>"]
		);
	}

	#[test]
	fn intact_references_are_left_alone() {
		let directory = StubDirectory::new();
		let raw = b"From: friend@sender.example.com\r\nReferences: <aaa@x> <bbb@y>\r\nSubject: hi\r\n\r\nhello\r\n";
		let mut envelope = envelope("<friend@sender.example.com>", &["FORM@example.dk"], raw);
		let before = envelope.message.as_bytes().to_vec();

		assert!(matches!(
			decide(&directory, &mut envelope),
			Verdict::Accept(_)
		));
		assert_eq!(envelope.message.as_bytes(), before);
	}

	#[test]
	fn two_damaged_references_headers_fail() {
		let directory = StubDirectory::new();
		let raw = b"From: friend@sender.example.com\r\nReferences: <a\r\n @x>\r\nReferences: <b\r\n @y>\r\nSubject: hi\r\n\r\nhello\r\n";
		let mut envelope = envelope("<friend@sender.example.com>", &["FORM@example.dk"], raw);

		match decide(&directory, &mut envelope) {
			Verdict::Failed(failure) => {
				assert!(failure.summary.starts_with("AmbiguousReferences"));
				assert!(failure.alert);
			}
			other => panic!("expected failure, got {:?}", other),
		}
	}

	#[test]
	fn accepted_mail_is_grouped_by_descriptor() {
		let directory = StubDirectory::new();
		let mut envelope = envelope(
			"<friend@sender.example.com>",
			&["REVY@example.dk", "FORM@example.dk"],
			PLAIN,
		);

		let deliveries = match decide(&directory, &mut envelope) {
			Verdict::Accept(deliveries) => deliveries,
			other => panic!("expected acceptance, got {:?}", other),
		};

		assert_eq!(deliveries.len(), 2);

		let revy = &deliveries[0];
		assert_eq!(
			revy.descriptor,
			AliasDescriptor::Group {
				name: "revy".to_string()
			}
		);
		assert_eq!(
			revy.recipients,
			vec![
				"user2@person.example.org",
				"user3@person.example.org",
				"user4@person.example.org"
			]
		);
		assert!(revy
			.headers
			.iter()
			.any(|(name, value)| name == "Precedence" && value == "bulk"));

		let form = &deliveries[1];
		assert_eq!(
			form.descriptor,
			AliasDescriptor::Title {
				root: "FORM".to_string(),
				period: 2013
			}
		);
		assert_eq!(form.recipients, vec!["user10@person.example.org"]);
		assert!(!form.headers.iter().any(|(name, _)| name == "Precedence"));
	}

	#[test]
	fn overlapping_recipients_get_one_copy() {
		let directory = StubDirectory::new();
		let mut envelope = envelope(
			"<friend@sender.example.com>",
			&["FORM@example.dk", "BEST@example.dk"],
			PLAIN,
		);

		let deliveries = match decide(&directory, &mut envelope) {
			Verdict::Accept(deliveries) => deliveries,
			other => panic!("expected acceptance, got {:?}", other),
		};

		// user 10 is both FORM and on the board; the later recipient owns them
		assert_eq!(deliveries.len(), 1);
		assert_eq!(
			deliveries[0].descriptor,
			AliasDescriptor::Period {
				kind: PeriodKind::Best,
				period: 2013
			}
		);
		assert_eq!(deliveries[0].recipients.len(), 8);
	}

	#[test]
	fn unknown_recipients_are_rejected_not_failed() {
		let directory = StubDirectory::new();
		let mut envelope = envelope(
			"<friend@sender.example.com>",
			&["NOBODY@example.dk"],
			PLAIN,
		);

		assert_eq!(
			reason(decide(&directory, &mut envelope)),
			"invalid recipient: NOBODY"
		);
	}

	#[test]
	fn groups_with_no_deliverable_addresses_are_rejected() {
		let mut directory = StubDirectory::new();
		directory.add_group(6, "ghost", "GHOST", &[99]);
		let mut envelope = envelope("<friend@sender.example.com>", &["GHOST@example.dk"], PLAIN);

		assert_eq!(
			reason(decide(&directory, &mut envelope)),
			"invalid recipient: no deliverable addresses"
		);
	}

	#[test]
	fn directory_problems_alert_once_per_kind() {
		let mut directory = StubDirectory::new();
		directory.add_group(9, "broken", "FU(?!X)", &[5]);
		let config = test_config();
		let state = RelayState::new();
		let pipeline = Pipeline::new(&config, &directory, &state);

		let mut first = envelope("<friend@sender.example.com>", &["FORM@example.dk"], PLAIN);
		match pipeline.decide(&mut first) {
			Verdict::Failed(failure) => {
				assert!(failure.summary.starts_with("BadGroupPattern"));
				assert!(failure.alert);
			}
			other => panic!("expected failure, got {:?}", other),
		}

		let mut second = envelope("<friend@sender.example.com>", &["FORM@example.dk"], PLAIN);
		match pipeline.decide(&mut second) {
			Verdict::Failed(failure) => assert!(!failure.alert),
			other => panic!("expected failure, got {:?}", other),
		}
	}

	#[test]
	fn long_recipient_lists_are_abbreviated_in_logs() {
		let state = RelayState::new();
		let long = "x".repeat(250);

		assert_eq!(state.abbreviate_log_line("short".to_string()), "short");
		assert_eq!(
			state.abbreviate_log_line(long.clone()),
			format!("{} [1]", long)
		);
		assert_eq!(
			state.abbreviate_log_line(long.clone()),
			format!("{}... [1]", &long[..197])
		);

		for _ in 0..41 {
			state.abbreviate_log_line("short".to_string());
		}
		assert_eq!(
			state.abbreviate_log_line(long.clone()),
			format!("{} [44]", long)
		);
	}
}
