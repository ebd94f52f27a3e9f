use mailparse::{parse_headers, parse_mail, MailHeaderMap, MailParseError, ParsedMail};

/// A received message, kept as the raw bytes that came in over the
/// wire. Header access goes through mailparse on demand; the bytes are
/// what eventually gets relayed or archived, so we never re-serialize
/// the whole message.
#[derive(Clone, Debug)]
pub struct Message {
	raw: Vec<u8>,
}

impl Message {
	pub fn new(raw: Vec<u8>) -> Self {
		Self { raw }
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.raw
	}

	pub fn parse(&self) -> Result<ParsedMail<'_>, MailParseError> {
		parse_mail(&self.raw)
	}

	pub fn raw_header_block(&self) -> &[u8] {
		&self.raw[..header_len(&self.raw)]
	}

	pub fn raw_header_contains(&self, needle: &str) -> bool {
		let head = self.raw_header_block().to_ascii_lowercase();
		let needle = needle.to_ascii_lowercase();

		!needle.is_empty() && head.windows(needle.len()).any(|w| w == needle.as_bytes())
	}

	/// The first value of the named header, RFC 2047 decoded and
	/// unfolded. None if the header is absent.
	pub fn get_header(&self, name: &str) -> Option<String> {
		let (headers, _) = parse_headers(self.raw_header_block()).ok()?;
		headers.get_first_value(name)
	}

	pub fn get_all_headers(&self, name: &str) -> Vec<String> {
		match parse_headers(self.raw_header_block()) {
			Ok((headers, _)) => headers.get_all_values(name),
			Err(_) => vec![],
		}
	}

	pub fn subject(&self) -> String {
		self.get_header("Subject").unwrap_or_default()
	}

	pub fn content_type(&self) -> String {
		self.get_header("Content-Type").unwrap_or_default()
	}

	/// True if any header carries bytes no charset was declared for.
	/// Decoding such a message is guesswork, so the pipeline refuses it.
	pub fn has_unknown_charset(&self) -> bool {
		let head = self.raw_header_block();
		if head.iter().any(|b| *b >= 0x80) {
			return true;
		}

		self.raw_header_contains("=?unknown-8bit?")
	}

	/// Replace every occurrence of the named header (continuation lines
	/// included) with a single one carrying `value`, at the position of
	/// the first occurrence. Appends to the header block if absent.
	pub fn set_unique_header(&mut self, name: &str, value: &str) {
		let raw = std::mem::take(&mut self.raw);
		let (head, rest) = raw.split_at(header_len(&raw));
		let eol: &[u8] = if head.windows(2).any(|w| w == b"\r\n") {
			b"\r\n"
		} else {
			b"\n"
		};

		let mut lines: Vec<&[u8]> = vec![];
		let mut start = 0;
		for (i, b) in head.iter().enumerate() {
			if *b == b'\n' {
				lines.push(&head[start..=i]);
				start = i + 1;
			}
		}
		if start < head.len() {
			lines.push(&head[start..]);
		}

		let matches_name = |line: &[u8]| -> bool {
			if line.len() <= name.len() || !line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
			{
				return false;
			}
			let after = &line[name.len()..];
			let colon = after.iter().position(|b| *b != b' ' && *b != b'\t');
			colon.map(|i| after[i]) == Some(b':')
		};

		let mut out: Vec<u8> = Vec::with_capacity(raw.len() + name.len() + value.len() + 4);
		let mut insert_at: Option<usize> = None;
		let mut removing = false;
		for line in lines {
			if matches_name(line) {
				if insert_at.is_none() {
					insert_at = Some(out.len());
				}
				removing = true;
				continue;
			}
			if removing && matches!(line.first(), Some(b' ') | Some(b'\t')) {
				continue;
			}
			removing = false;
			out.extend_from_slice(line);
		}

		let mut header_line = Vec::new();
		header_line.extend_from_slice(name.as_bytes());
		header_line.extend_from_slice(b": ");
		header_line.extend_from_slice(value.as_bytes());
		header_line.extend_from_slice(eol);

		let at = insert_at.unwrap_or(out.len());
		out.splice(at..at, header_line);
		out.extend_from_slice(rest);
		self.raw = out;
	}

	/// A copy of the raw bytes with extra headers prepended, for the
	/// outbound copies the relay sends per recipient group.
	pub fn with_headers(&self, extra: &[(String, String)]) -> Vec<u8> {
		let eol: &[u8] = if self.raw_header_block().windows(2).any(|w| w == b"\r\n") {
			b"\r\n"
		} else {
			b"\n"
		};

		let mut out = Vec::with_capacity(self.raw.len() + extra.len() * 32);
		for (name, value) in extra {
			out.extend_from_slice(name.as_bytes());
			out.extend_from_slice(b": ");
			out.extend_from_slice(value.as_bytes());
			out.extend_from_slice(eol);
		}
		out.extend_from_slice(&self.raw);
		out
	}
}

/// Byte length of the header block, up to but not including the blank
/// line that separates it from the body.
fn header_len(raw: &[u8]) -> usize {
	for (i, b) in raw.iter().enumerate() {
		if *b == b'\n' {
			if raw.get(i + 1) == Some(&b'\n') {
				return i + 1;
			}
			if raw.get(i + 1) == Some(&b'\r') && raw.get(i + 2) == Some(&b'\n') {
				return i + 1;
			}
		}
	}

	raw.len()
}

#[cfg(test)]
mod test {
	use super::*;

	fn message() -> Message {
		Message::new(
			b"From: a@example.dk\r\nTo: b@example.dk\r\nSubject: hello\r\n\r\nbody\r\n".to_vec(),
		)
	}

	#[test]
	fn header_access() {
		let msg = message();

		assert_eq!(msg.get_header("From").unwrap(), "a@example.dk");
		assert_eq!(msg.get_header("subject").unwrap(), "hello");
		assert_eq!(msg.get_header("X-Missing"), None);
		assert_eq!(msg.subject(), "hello");
	}

	#[test]
	fn rfc2047_subject() {
		let msg = Message::new(b"Subject: =?utf-8?q?bl=C3=A5b=C3=A6r?=\r\n\r\n".to_vec());

		assert_eq!(msg.subject(), "bl\u{e5}b\u{e6}r");
	}

	#[test]
	fn unknown_charset() {
		assert!(!message().has_unknown_charset());

		let raw8bit = Message::new(b"Subject: bl\xe5b\xe6r\r\n\r\nbody".to_vec());
		assert!(raw8bit.has_unknown_charset());

		let tagged =
			Message::new(b"Subject: =?unknown-8bit?q?what?=\r\n\r\nbody".to_vec());
		assert!(tagged.has_unknown_charset());

		// 8-bit bytes in the body are fine
		let body = Message::new(b"Subject: ok\r\n\r\nbl\xe5b\xe6r".to_vec());
		assert!(!body.has_unknown_charset());
	}

	#[test]
	fn set_unique_header_replaces_all() {
		let mut msg = Message::new(
			b"References: <a@b>\r\nSubject: s\r\nReferences: <c@d>\r\n <e@f>\r\n\r\nbody"
				.to_vec(),
		);

		msg.set_unique_header("References", "<g@h>");

		assert_eq!(msg.get_all_headers("References"), vec!["<g@h>"]);
		assert_eq!(msg.get_header("Subject").unwrap(), "s");
		assert!(String::from_utf8_lossy(msg.as_bytes()).ends_with("body"));
		assert!(String::from_utf8_lossy(msg.as_bytes()).starts_with("References: <g@h>\r\n"));
	}

	#[test]
	fn set_unique_header_appends_when_missing() {
		let mut msg = message();
		msg.set_unique_header("X-New", "value");

		assert_eq!(msg.get_header("X-New").unwrap(), "value");
		assert_eq!(msg.get_header("Subject").unwrap(), "hello");
	}

	#[test]
	fn with_headers_prepends() {
		let msg = message();
		let out = msg.with_headers(&[("Precedence".to_string(), "bulk".to_string())]);

		assert!(String::from_utf8_lossy(&out).starts_with("Precedence: bulk\r\nFrom:"));
	}

	#[test]
	fn raw_header_contains_is_case_insensitive() {
		let msg = message();

		assert!(msg.raw_header_contains("subject: HELLO"));
		assert!(!msg.raw_header_contains("body"));
	}
}
