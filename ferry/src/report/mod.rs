mod catalog;

pub use catalog::summarize;

use mailparse::{parse_headers, MailHeaderMap, MailParseError, ParsedMail};
use serde::Serialize;
use thiserror::Error;

use crate::{config::Config, message::Message};

/// RFC 3464 disposition of one recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportAction {
	Failed,
	Delayed,
	Delivered,
	Relayed,
	Expanded,
}

impl ReportAction {
	fn parse(value: &str) -> Result<Self, ReportError> {
		match value.trim().to_lowercase().as_str() {
			"failed" => Ok(Self::Failed),
			"delayed" => Ok(Self::Delayed),
			"delivered" => Ok(Self::Delivered),
			"relayed" => Ok(Self::Relayed),
			"expanded" => Ok(Self::Expanded),
			other => Err(ReportError::BadAction(other.to_string())),
		}
	}

	fn phrase(&self) -> &'static str {
		match self {
			Self::Failed => "delivery failed",
			Self::Delayed => "delivery delayed",
			Self::Delivered => "delivered",
			Self::Relayed => "relayed",
			Self::Expanded => "expanded",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
	Success,
	Transient,
	Permanent,
}

/// An RFC 3463 status like `5.1.1`, class-checked on parse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Status {
	pub class: StatusClass,
	pub code: String,
}

impl Status {
	fn parse(value: &str) -> Result<Self, ReportError> {
		let code = value.trim().to_string();
		let class = match code.get(..2) {
			Some("2.") => StatusClass::Success,
			Some("4.") => StatusClass::Transient,
			Some("5.") => StatusClass::Permanent,
			_ => return Err(ReportError::BadStatus(code)),
		};

		Ok(Self { class, code })
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
	pub kind: String,
	pub text: String,
}

/// One per-recipient block of a delivery report.
#[derive(Clone, Debug, Serialize)]
pub struct RecipientStatus {
	pub recipient: String,
	pub action: ReportAction,
	pub status: Status,
	pub remote_mta: Option<String>,
	pub diagnostic: Option<Diagnostic>,
	pub will_retry: bool,
}

/// A parsed delivery report: the structured per-recipient records, the
/// consolidated human notification, and enough of the undelivered
/// message to archive the failure under its *original* envelope.
#[derive(Clone, Debug, Serialize)]
pub struct DeliveryReport {
	pub reporting_mta: String,
	pub received_from_mta: Option<String>,
	pub recipients: Vec<RecipientStatus>,
	pub notification: String,
	pub original_sender: Option<String>,
	pub original_recipients: Vec<String>,
	pub original_subject: Option<String>,
	pub original_date: Option<String>,
}

/// A structural RFC 3464 violation. Recoverable: batch scans log one
/// of these and move on to the next archived report.
#[derive(Error, Debug)]
pub enum ReportError {
	#[error("malformed mime: {0}")]
	Mime(#[from] MailParseError),
	#[error("expected 3 report parts, found {0}")]
	PartCount(usize),
	#[error("unexpected report part content-type {0}")]
	PartType(String),
	#[error("missing required field {0}")]
	MissingField(&'static str),
	#[error("field {0} is not a typed field")]
	Untyped(&'static str),
	#[error("reporting MTA is of kind {0}, not dns")]
	BadReportingMta(String),
	#[error("final recipient is of kind {0}, not rfc822")]
	BadFinalRecipient(String),
	#[error("invalid action {0}")]
	BadAction(String),
	#[error("invalid status {0}")]
	BadStatus(String),
	#[error("report has no per-recipient blocks")]
	NoRecipients,
}

/// Try to read `message` as a delivery report for something we relayed
/// earlier.
///
/// `Ok(None)` means the message isn't one of our reports: wrong
/// content type, or a sender other than our reporting MTA with no list
/// marker in the headers. Bounce-shaped spam lands there. A message
/// that passes the gate but violates RFC 3464 is a [`ReportError`].
pub fn parse_delivery_report(
	message: &Message,
	config: &Config,
) -> Result<Option<DeliveryReport>, ReportError> {
	let parsed = message.parse()?;
	if !is_delivery_status(&parsed) {
		return Ok(None);
	}

	let from = message.get_header("From").unwrap_or_default();
	let from = from_address(&from);
	let from_known = config
		.report_senders
		.iter()
		.any(|sender| from.eq_ignore_ascii_case(sender));
	let marker_known = config
		.list_markers
		.iter()
		.any(|marker| message.raw_header_contains(marker));
	if !from_known && !marker_known {
		return Ok(None);
	}

	if parsed.subparts.len() != 3 {
		return Err(ReportError::PartCount(parsed.subparts.len()));
	}
	let notification_part = &parsed.subparts[0];
	let status_part = &parsed.subparts[1];
	let undelivered_part = &parsed.subparts[2];

	if !notification_part.subparts.is_empty() {
		return Err(ReportError::PartType(
			notification_part.ctype.mimetype.clone(),
		));
	}
	if status_part.ctype.mimetype != "message/delivery-status" {
		return Err(ReportError::PartType(status_part.ctype.mimetype.clone()));
	}

	let (reporting_mta, received_from_mta, recipients) =
		parse_status_blocks(&status_part.get_body()?)?;

	let undelivered = match undelivered_part.ctype.mimetype.as_str() {
		"message/rfc822" | "text/rfc822-headers" => undelivered_part.get_body()?,
		other => return Err(ReportError::PartType(other.to_string())),
	};
	let (headers, _) = parse_headers(undelivered.as_bytes())?;

	let original_sender = headers
		.get_first_value("Return-Path")
		.map(|path| {
			path.trim()
				.trim_start_matches('<')
				.trim_end_matches('>')
				.to_string()
		});
	let original_subject = headers.get_first_value("Subject");
	let original_date = headers.get_first_value("Date");
	let original_recipients = recipients
		.iter()
		.map(|record| record.recipient.clone())
		.collect();

	let notification = render_notification(&recipients);

	Ok(Some(DeliveryReport {
		reporting_mta,
		received_from_mta,
		recipients,
		notification,
		original_sender,
		original_recipients,
		original_subject,
		original_date,
	}))
}

/// The address portion of a From header: the angle-bracketed part if
/// there is one, the first word otherwise. A display name quoting some
/// other address must not pass the sender gate.
fn from_address(from: &str) -> &str {
	if let (Some(start), Some(end)) = (from.find('<'), from.rfind('>')) {
		if start < end {
			return &from[start + 1..end];
		}
	}

	from.split_whitespace().next().unwrap_or("")
}

fn is_delivery_status(parsed: &ParsedMail) -> bool {
	parsed.ctype.mimetype == "multipart/report"
		&& parsed
			.ctype
			.params
			.get("report-type")
			.map(|v| v.eq_ignore_ascii_case("delivery-status"))
			.unwrap_or(false)
}

/// `kind; value` per RFC 3464 typed fields.
fn typed_field(value: &str, field: &'static str) -> Result<(String, String), ReportError> {
	let (kind, rest) = value.split_once(';').ok_or(ReportError::Untyped(field))?;

	Ok((kind.trim().to_string(), rest.trim().to_string()))
}

/// The blocks of a `message/delivery-status` body: one message-level
/// block, then one block per recipient. Blocks with no fields at all
/// are skipped; some senders emit them.
fn parse_status_blocks(
	body: &str,
) -> Result<(String, Option<String>, Vec<RecipientStatus>), ReportError> {
	let normalized = body.replace("\r\n", "\n");
	let mut blocks = vec![];
	for chunk in normalized.split("\n\n") {
		let (headers, _) = parse_headers(chunk.trim().as_bytes())?;
		if !headers.is_empty() {
			blocks.push(headers);
		}
	}

	let mut blocks = blocks.into_iter();
	let message_block = blocks.next().ok_or(ReportError::MissingField("Reporting-MTA"))?;

	let reporting = message_block
		.get_first_value("Reporting-MTA")
		.ok_or(ReportError::MissingField("Reporting-MTA"))?;
	let (kind, reporting_mta) = typed_field(&reporting, "Reporting-MTA")?;
	if !kind.eq_ignore_ascii_case("dns") {
		return Err(ReportError::BadReportingMta(kind));
	}

	let received_from_mta = match message_block.get_first_value("Received-From-MTA") {
		Some(value) => Some(typed_field(&value, "Received-From-MTA")?.1),
		None => None,
	};

	let mut recipients = vec![];
	for block in blocks {
		let final_recipient = block
			.get_first_value("Final-Recipient")
			.ok_or(ReportError::MissingField("Final-Recipient"))?;
		let (kind, recipient) = typed_field(&final_recipient, "Final-Recipient")?;
		if !kind.eq_ignore_ascii_case("rfc822") {
			return Err(ReportError::BadFinalRecipient(kind));
		}

		let action = ReportAction::parse(
			&block
				.get_first_value("Action")
				.ok_or(ReportError::MissingField("Action"))?,
		)?;
		let status = Status::parse(
			&block
				.get_first_value("Status")
				.ok_or(ReportError::MissingField("Status"))?,
		)?;

		let remote_mta = match block.get_first_value("Remote-MTA") {
			Some(value) => Some(typed_field(&value, "Remote-MTA")?.1),
			None => None,
		};
		let diagnostic = match block.get_first_value("Diagnostic-Code") {
			Some(value) => {
				let (kind, text) = typed_field(&value, "Diagnostic-Code")?;
				Some(Diagnostic { kind, text })
			}
			None => None,
		};
		let will_retry = block.get_first_value("Will-Retry-Until").is_some();

		recipients.push(RecipientStatus {
			recipient,
			action,
			status,
			remote_mta,
			diagnostic,
			will_retry,
		});
	}

	if recipients.is_empty() {
		return Err(ReportError::NoRecipients);
	}

	Ok((reporting_mta, received_from_mta, recipients))
}

fn describe(record: &RecipientStatus) -> String {
	if let Some(diagnostic) = &record.diagnostic {
		if diagnostic.kind.eq_ignore_ascii_case("smtp") {
			return summarize(record.remote_mta.as_deref(), &record.status, &diagnostic.text);
		}
	}

	let host = record.remote_mta.as_deref().unwrap_or("unknown host");
	format!("{} ({} from {})", record.action.phrase(), record.status.code, host)
}

/// One line per distinct failure message, recipients abbreviated.
fn render_notification(records: &[RecipientStatus]) -> String {
	let mut groups: Vec<(String, Vec<String>, bool)> = vec![];
	for record in records {
		let message = describe(record);
		match groups.iter_mut().find(|(m, _, _)| *m == message) {
			Some((_, recipients, retry)) => {
				recipients.push(record.recipient.clone());
				*retry |= record.will_retry;
			}
			None => groups.push((message, vec![record.recipient.clone()], record.will_retry)),
		}
	}

	groups
		.iter()
		.map(|(message, recipients, retry)| {
			let mut line = format!("{}: {}", abbreviate_recipients(recipients), message);
			if *retry {
				line.push_str("; message will be retried");
			}
			line
		})
		.collect::<Vec<_>>()
		.join("; ")
}

/// `<a,b@domain>, <c@other>`: recipients sorted and grouped by domain
/// so a mass bounce reads as one mailbox list per host.
pub fn abbreviate_recipients(recipients: &[String]) -> String {
	if !recipients.iter().all(|recipient| recipient.contains('@')) {
		return recipients
			.iter()
			.map(|recipient| format!("<{}>", recipient))
			.collect::<Vec<_>>()
			.join(", ");
	}

	let mut parts: Vec<(&str, &str)> = recipients
		.iter()
		.filter_map(|recipient| recipient.split_once('@'))
		.collect();
	parts.sort_by_key(|(local, domain)| (domain.to_lowercase(), local.to_lowercase()));

	let mut abbreviated = vec![];
	let mut i = 0;
	while i < parts.len() {
		let domain = parts[i].1;
		let mut locals = vec![parts[i].0];
		let mut j = i + 1;
		while j < parts.len() && parts[j].1 == domain {
			locals.push(parts[j].0);
			j += 1;
		}
		abbreviated.push(format!("<{}@{}>", locals.join(","), domain));
		i = j;
	}

	abbreviated.join(", ")
}
