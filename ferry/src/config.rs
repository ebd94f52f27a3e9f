/// Everything the decision pipeline needs to know about the site it
/// runs for. Built once at startup by the daemon; the library never
/// reads files or the environment itself.
#[derive(Clone, Debug)]
pub struct Config {
	/// The organization domain we accept mail for, e.g. `example.dk`.
	pub domain: String,
	/// Local part of the administrator alias, usually `admin`.
	pub admin_local: String,
	/// Envelope sender used for relayed copies and alert mail.
	pub sender: String,
	/// `From` header values that identify our reporting MTA. A message
	/// claiming to be a delivery report is only parsed as one if its
	/// From header contains one of these.
	pub report_senders: Vec<String>,
	/// Raw header fragments that mark traffic from our own lists.
	pub list_markers: Vec<String>,
	/// Administrator mailboxes used when the directory can't tell us.
	pub fallback_admins: Vec<String>,
	/// Reject unsigned mail from strict-DMARC sender domains. Off by
	/// default; too many legitimate senders fail it in practice.
	pub enforce_dmarc: bool,
}

impl Config {
	pub fn admin_address(&self) -> String {
		format!("{}@{}", self.admin_local, self.domain)
	}
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
	Config {
		domain: "example.dk".into(),
		admin_local: "admin".into(),
		sender: "admin@example.dk".into(),
		report_senders: vec!["MAILER-DAEMON@relay.example.dk".into()],
		list_markers: vec!["list.example.dk".into()],
		fallback_admins: vec!["root@relay.example.dk".into()],
		enforce_dmarc: false,
	}
}
