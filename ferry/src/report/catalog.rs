//! Known remote-server responses, collected from years of archived
//! bounces. Matching a diagnostic here turns a screenful of remote
//! boilerplate into a few words.

use std::sync::OnceLock;

use regex::Regex;

use super::Status;

struct CatalogEntry {
	code: &'static str,
	summary: &'static str,
	needle: &'static str,
}

struct HostPatterns {
	domain: &'static str,
	entries: &'static [CatalogEntry],
	/// Cleanup applied to the diagnostic text before entry matching.
	preprocess: Option<fn(code: &str, text: String) -> String>,
	/// Cleanup applied to the text quoted in the fallback template.
	fallback: Option<fn(String) -> String>,
}

const CATALOG: &[HostPatterns] = &[
	HostPatterns {
		domain: "google.com",
		entries: &[
			CatalogEntry {
				code: "421-4.7.0",
				summary: "Unusual rate of spam",
				needle: "Our system has detected an unusual rate of unsolicited mail \
					originating from your IP address. To protect our users from spam, \
					mail sent from your IP address has been temporarily rate limited.",
			},
			CatalogEntry {
				code: "421-4.7.0",
				summary: "421 looks like spam",
				needle: "Our system has detected that this message is suspicious due to \
					the nature of the content and/or the links within. To best \
					protect our users from spam, the message has been blocked.",
			},
			CatalogEntry {
				code: "552-5.7.0",
				summary: "Attachment virus",
				needle: "This message was blocked because its content presents a potential \
					security issue.",
			},
			CatalogEntry {
				code: "550-5.7.1",
				summary: "DMARC failure",
				needle: "is not accepted due to domain's DMARC policy.",
			},
			CatalogEntry {
				code: "550-5.7.1",
				summary: "550 looks like spam",
				needle: "Our system has detected that this message is likely unsolicited \
					mail. To reduce the amount of spam sent to Gmail, this message \
					has been blocked.",
			},
			CatalogEntry {
				code: "550-5.1.1",
				summary: "No such user",
				needle: "The email account that you tried to reach does not exist. Please \
					try double-checking the recipient's email address for typos or \
					unnecessary spaces.",
			},
		],
		// Google repeats the code inside the message at unpredictable
		// positions (line breaks before the reporting MTA's rewrapping),
		// so strip every echo of it before matching.
		preprocess: Some(strip_code_echoes),
		fallback: None,
	},
	HostPatterns {
		domain: "hotmail.com",
		entries: &[
			CatalogEntry {
				code: "550 5.7.0",
				summary: "Domain owner policy restrictions",
				needle: "could not be delivered due to domain owner policy restrictions.",
			},
			CatalogEntry {
				code: "550 5.7.0",
				summary: "Not RFC 5322",
				needle: "Message could not be delivered. Please ensure the message is \
					RFC 5322 compliant.",
			},
			CatalogEntry {
				code: "550",
				summary: "IP blocked",
				needle: "Please contact your Internet service provider since part of their \
					network is on our block list.",
			},
			CatalogEntry {
				code: "550",
				summary: "Mailbox unavailable",
				needle: "Requested action not taken: mailbox unavailable",
			},
		],
		preprocess: None,
		fallback: None,
	},
	HostPatterns {
		domain: "yahoodns.net",
		entries: &[CatalogEntry {
			code: "554 5.7.9",
			summary: "DMARC failure",
			needle: "Message not accepted for policy reasons. See \
				https://help.yahoo.com/kb/postmaster/SLN7253.html",
		}],
		preprocess: None,
		fallback: None,
	},
	HostPatterns {
		domain: "sitnet.dk",
		entries: &[CatalogEntry {
			code: "550 5.7.1",
			summary: "Content rejected",
			needle: "Error: content rejected / indhold afvist",
		}],
		preprocess: None,
		fallback: None,
	},
	HostPatterns {
		domain: "127.0.0.1",
		entries: &[CatalogEntry {
			code: "550",
			summary: "Relay 550",
			needle: "Requested action not taken: mailbox unavailable (in reply to end \
				of DATA command)",
		}],
		preprocess: None,
		fallback: None,
	},
	HostPatterns {
		domain: "one.com",
		entries: &[],
		preprocess: None,
		// one.com appends a per-delivery reference id that would make
		// every fallback string unique
		fallback: Some(strip_reference_suffix),
	},
];

fn strip_code_echoes(code: &str, text: String) -> String {
	let text = text.replace(&format!("{} ", code), "");
	text.replace(&format!("{} ", code.replace('-', " ")), "")
}

fn strip_reference_suffix(text: String) -> String {
	static RE: OnceLock<Regex> = OnceLock::new();
	let re = RE.get_or_init(|| Regex::new(r" \([0-9a-f-]+\) \(in reply.*").unwrap());

	re.replace(&text, "").into_owned()
}

/// Collapse all whitespace runs to single spaces.
fn normalize(text: &str) -> String {
	text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The leading SMTP reply code of a diagnostic, e.g. `550-5.1.1` or
/// `550`, and the text after it.
fn split_code(text: &str) -> (Option<String>, String) {
	static RE: OnceLock<Regex> = OnceLock::new();
	let re = RE.get_or_init(|| Regex::new(r"^(\d+(?:[- ][0-9.]+)?) (.*)$").unwrap());

	match re.captures(text) {
		Some(caps) => (Some(caps[1].to_string()), caps[2].to_string()),
		None => (None, text.to_string()),
	}
}

/// Summarize one SMTP diagnostic against the catalog. A catalog hit
/// yields the entry's summary; a known host without a hit, or an
/// unknown host, yields the quoted text with code, status and host
/// attached.
pub fn summarize(remote_host: Option<&str>, status: &Status, diagnostic: &str) -> String {
	let text = normalize(diagnostic);
	let (code, rest) = split_code(&text);
	let code_token = code.clone().unwrap_or_else(|| status.code.clone());
	let tag = match &code {
		Some(code) => format!("{}-{}", &code[..code.len().min(3)], status.code),
		None => status.code.clone(),
	};

	let host = match remote_host {
		Some(host) => host.to_lowercase(),
		None => return format!("\"{}\" ({} from unknown host)", rest, tag),
	};

	for patterns in CATALOG {
		if host == patterns.domain || host.ends_with(&format!(".{}", patterns.domain)) {
			let rest = match patterns.preprocess {
				Some(preprocess) => preprocess(&code_token, rest),
				None => rest,
			};

			for entry in patterns.entries {
				if entry.code == code_token && rest.contains(&normalize(entry.needle)) {
					return entry.summary.to_string();
				}
			}

			let rest = match patterns.fallback {
				Some(fallback) => fallback(rest),
				None => rest,
			};

			return format!("\"{}\" ({} from {})", rest, tag, patterns.domain);
		}
	}

	format!("\"{}\" ({} from {})", rest, tag, host)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::report::StatusClass;

	fn status(code: &str) -> Status {
		let class = match code.as_bytes()[0] {
			b'2' => StatusClass::Success,
			b'4' => StatusClass::Transient,
			_ => StatusClass::Permanent,
		};
		Status {
			class,
			code: code.to_string(),
		}
	}

	#[test]
	fn google_no_such_user() {
		let diagnostic = "550-5.1.1 The email account that you tried to reach does \
			not exist. Please try 550-5.1.1 double-checking the recipient's email \
			address for typos or 550-5.1.1 unnecessary spaces.";

		assert_eq!(
			summarize(
				Some("gmail-smtp-in.l.google.com"),
				&status("5.1.1"),
				diagnostic
			),
			"No such user"
		);
	}

	#[test]
	fn google_strips_spaced_code_echoes_too() {
		let diagnostic = "550-5.7.1 This message 550 5.7.1 is not accepted due to \
			domain's DMARC policy.";

		assert_eq!(
			summarize(Some("alt1.gmail-smtp-in.l.google.com"), &status("5.7.1"), diagnostic),
			"DMARC failure"
		);
	}

	#[test]
	fn hotmail_bare_code() {
		let diagnostic = "550 Requested action not taken: mailbox unavailable";

		assert_eq!(
			summarize(Some("mx2.hotmail.com"), &status("5.0.0"), diagnostic),
			"Mailbox unavailable"
		);
	}

	#[test]
	fn known_host_without_entry_quotes_the_text() {
		let summary = summarize(
			Some("mta7.am0.yahoodns.net"),
			&status("4.7.0"),
			"421 4.7.0 [TSS04] Messages temporarily deferred",
		);

		assert_eq!(
			summary,
			"\"[TSS04] Messages temporarily deferred\" (421-4.7.0 from yahoodns.net)"
		);
	}

	#[test]
	fn one_com_reference_is_stripped() {
		let summary = summarize(
			Some("mxcluster1.one.com"),
			&status("5.2.2"),
			"552 5.2.2 Mailbox is full (deadbeef-1234-abcd) (in reply to RCPT TO command)",
		);

		assert_eq!(summary, "\"Mailbox is full\" (552-5.2.2 from one.com)");
	}

	#[test]
	fn unknown_host_uses_raw_host() {
		let summary = summarize(
			Some("mail.example.net"),
			&status("5.1.1"),
			"550 5.1.1 no mailbox here",
		);

		assert_eq!(summary, "\"no mailbox here\" (550-5.1.1 from mail.example.net)");
	}

	#[test]
	fn missing_code_falls_back_to_status() {
		let summary = summarize(Some("mail.example.net"), &status("5.1.1"), "no mailbox here");

		assert_eq!(summary, "\"no mailbox here\" (5.1.1 from mail.example.net)");
	}
}
