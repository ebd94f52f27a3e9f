use std::sync::OnceLock;

use regex::Regex;

use crate::{
	addr::{Address, ReversePath},
	config::Config,
	message::Message,
};

/// One inbound SMTP transaction: reverse path, recipients, message.
/// Built by the transport and consumed once by the pipeline.
#[derive(Clone, Debug)]
pub struct Envelope {
	pub reverse_path: ReversePath,
	pub recipients: Vec<Address>,
	pub message: Message,
	/// Whether the sender's From domain publishes a strict DMARC
	/// policy. The transport looks this up before handing the envelope
	/// over; the decision core itself does no network I/O.
	pub strict_dmarc_policy: bool,
}

impl Envelope {
	pub fn new(reverse_path: ReversePath, recipients: Vec<Address>, message: Message) -> Self {
		Self {
			reverse_path,
			recipients,
			message,
			strict_dmarc_policy: false,
		}
	}

	pub fn sender_string(&self) -> String {
		match &self.reverse_path {
			ReversePath::Null => "<>".to_string(),
			ReversePath::Regular(address) => address.to_string(),
		}
	}

	/// The domain of the From header, as loosely as mail in the wild
	/// requires: everything after the last `@` up to whitespace or `>`.
	pub fn from_domain(&self) -> Option<String> {
		static RE: OnceLock<Regex> = OnceLock::new();
		let re = RE.get_or_init(|| Regex::new(r"@([^ \t\n>]+)").unwrap());

		let from = self.message.get_header("From")?;
		re.captures(&from).map(|caps| caps[1].to_string())
	}

	pub fn is_to_admin_only(&self, config: &Config) -> bool {
		self.recipients.len() == 1
			&& self.recipients[0]
				.to_string()
				.eq_ignore_ascii_case(&config.admin_address())
	}
}
