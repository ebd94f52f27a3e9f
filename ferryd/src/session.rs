use std::sync::Arc;

use ferry::{
	addr::{Address, ReversePath},
	envelope::Envelope,
	message::Message,
};
use tokio::sync::mpsc::UnboundedSender as Sender;

use crate::binconfig::BinConfig;

pub struct Reply {
	code: u16,
	text: String,
}

impl Reply {
	fn new<S: Into<String>>(code: u16, text: S) -> Self {
		Self {
			code,
			text: text.into(),
		}
	}

	pub fn as_string(&self) -> String {
		format!("{} {}\r\n", self.code, self.text)
	}
}

/// One SMTP conversation. Fed raw reads, hands back replies, and sends
/// a finished [`Envelope`] down the channel on every completed DATA.
///
/// This is the receiving side of our upstream MTA only; it speaks just
/// enough SMTP for that and rejects recipients outside our domain.
pub struct Session {
	config: Arc<BinConfig>,
	envelope_sender: Sender<Envelope>,
	state: State,
	line: String,
	reverse_path: ReversePath,
	recipients: Vec<Address>,
}

impl Session {
	pub fn initiate(envelope_sender: Sender<Envelope>, config: Arc<BinConfig>) -> (Self, Reply) {
		let greeting = Reply::new(220, format!("{} ferryd service ready", config.hostname));

		(
			Self {
				config,
				envelope_sender,
				state: Default::default(),
				line: Default::default(),
				reverse_path: Default::default(),
				recipients: Default::default(),
			},
			greeting,
		)
	}

	pub fn push(&mut self, chunk: &str) -> Option<Reply> {
		self.line.push_str(chunk);

		if self.state == State::LoadingData {
			return self.loading_data();
		}

		// Not a full line yet
		if !self.line.ends_with("\r\n") {
			return None;
		}

		let reply = self.run_command();
		self.line.clear();

		Some(reply)
	}

	pub fn should_exit(&self) -> bool {
		self.state == State::Exit
	}

	fn loading_data(&mut self) -> Option<Reply> {
		if self.line == ".\r\n" || self.line.ends_with("\r\n.\r\n") {
			Some(self.got_data())
		} else {
			None
		}
	}

	fn got_data(&mut self) -> Reply {
		let body = std::mem::take(&mut self.line);
		let envelope = Envelope::new(
			std::mem::take(&mut self.reverse_path),
			std::mem::take(&mut self.recipients),
			Message::new(unstuff(&body)),
		);

		self.state = State::Greeted;

		if self.envelope_sender.send(envelope).is_err() {
			return Reply::new(451, "Internal channel error");
		}

		Reply::new(250, "message accepted for delivery")
	}

	fn run_command(&mut self) -> Reply {
		let line = self.line.trim_end().to_string();
		let (verb, args) = line.split_once(' ').unwrap_or((line.as_str(), ""));

		match verb.to_ascii_uppercase().as_str() {
			"HELO" | "EHLO" => self.helo(args),
			"MAIL" => self.mail(args),
			"RCPT" => self.rcpt(args),
			"DATA" => self.data(),
			"RSET" => self.rset(),
			"NOOP" => Reply::new(250, "Okay"),
			"QUIT" => self.quit(),
			_ => Reply::new(500, "Syntax error"),
		}
	}

	fn helo(&mut self, client: &str) -> Reply {
		// EHLO resets the transaction like RSET would
		self.rset();
		self.state = State::Greeted;

		Reply::new(
			250,
			format!("{} (ferryd) greets {}", self.config.hostname, client),
		)
	}

	fn mail(&mut self, args: &str) -> Reply {
		if self.state != State::Greeted {
			return Self::bad_sequence();
		}

		let path = match strip_keyword(args, "FROM:") {
			Some(path) => path,
			None => return Reply::new(501, "Expected FROM:<reverse-path>"),
		};

		match path.trim().parse() {
			Ok(reverse_path) => {
				self.reverse_path = reverse_path;
				self.state = State::GotReversePath;
				Reply::new(250, "Okay")
			}
			Err(_) => Reply::new(553, "Bad reverse-path"),
		}
	}

	fn rcpt(&mut self, args: &str) -> Reply {
		if self.state != State::GotReversePath && self.state != State::GotRecipient {
			return Self::bad_sequence();
		}

		let path = match strip_keyword(args, "TO:") {
			Some(path) => path,
			None => return Reply::new(501, "Expected TO:<forward-path>"),
		};

		match Address::from_bracketed(path.trim()) {
			Ok(address) => {
				if !address.domain.is(&self.config.core.domain) {
					return Reply::new(550, "relay not permitted");
				}

				self.recipients.push(address);
				self.state = State::GotRecipient;
				Reply::new(250, "Okay")
			}
			Err(_) => Reply::new(553, "Bad forward-path"),
		}
	}

	fn data(&mut self) -> Reply {
		if self.state == State::GotRecipient {
			self.state = State::LoadingData;
			Reply::new(354, "Start mail input")
		} else {
			Self::bad_sequence()
		}
	}

	fn rset(&mut self) -> Reply {
		self.reverse_path = Default::default();
		self.recipients.clear();

		self.state = match self.state {
			State::Initiated => State::Initiated,
			_ => State::Greeted,
		};

		Reply::new(250, "Okay")
	}

	fn quit(&mut self) -> Reply {
		self.state = State::Exit;

		Reply::new(221, format!("{} Goodbye", self.config.hostname))
	}

	fn bad_sequence() -> Reply {
		Reply::new(503, "bad sequence of commands")
	}
}

fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
	// get() refuses a split inside a multi-byte character, which a raw
	// client can put anywhere in the argument position
	match args.get(..keyword.len()) {
		Some(head) if head.eq_ignore_ascii_case(keyword) => Some(&args[keyword.len()..]),
		_ => None,
	}
}

/// Remove the terminating `.` line and transparency dots.
fn unstuff(body: &str) -> Vec<u8> {
	let body = body.strip_suffix(".\r\n").unwrap_or(body);

	let mut data = String::with_capacity(body.len());
	for line in body.split_inclusive("\r\n") {
		data.push_str(line.strip_prefix('.').unwrap_or(line));
	}

	data.into_bytes()
}

#[derive(PartialEq)]
enum State {
	Initiated,
	Greeted,
	GotReversePath,
	GotRecipient,
	LoadingData,
	Exit,
}

impl Default for State {
	fn default() -> Self {
		Self::Initiated
	}
}
