//! A deliberately linear SMTP client for handing finished copies to
//! the upstream relay. One connection per recipient group; the relay
//! does queueing and retries, we don't.

use std::time::Duration;

use thiserror::Error;
use tokio::{
	io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
	net::TcpStream,
	time::timeout,
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum RelayError {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("upstream relay timed out")]
	Timeout,
	#[error("upstream relay closed the connection")]
	Closed,
	#[error("unparseable reply: {0}")]
	BadReply(String),
	#[error("expected {expected}, relay said: {reply}")]
	UnexpectedReply { expected: u16, reply: String },
}

pub async fn send(
	address: &str,
	port: u16,
	hostname: &str,
	sender: &str,
	recipients: &[String],
	data: &[u8],
) -> Result<(), RelayError> {
	let stream = timeout(REPLY_TIMEOUT, TcpStream::connect((address, port)))
		.await
		.map_err(|_| RelayError::Timeout)??;
	let (read, mut write) = stream.into_split();
	let mut lines = BufReader::new(read).lines();

	expect(&mut lines, 220).await?;

	write
		.write_all(format!("EHLO {}\r\n", hostname).as_bytes())
		.await?;
	expect(&mut lines, 250).await?;

	write
		.write_all(format!("MAIL FROM:<{}>\r\n", sender).as_bytes())
		.await?;
	expect(&mut lines, 250).await?;

	for recipient in recipients {
		write
			.write_all(format!("RCPT TO:<{}>\r\n", recipient).as_bytes())
			.await?;
		expect(&mut lines, 250).await?;
	}

	write.write_all(b"DATA\r\n").await?;
	expect(&mut lines, 354).await?;

	write.write_all(&dot_stuff(data)).await?;
	write.write_all(b".\r\n").await?;
	expect(&mut lines, 250).await?;

	write.write_all(b"QUIT\r\n").await?;
	// the message is accepted either way, don't fuss over the goodbye
	let _ = expect(&mut lines, 221).await;

	Ok(())
}

/// Read one reply, skipping `250-`style continuation lines, and check
/// its code.
async fn expect<R: AsyncBufRead + Unpin>(
	lines: &mut Lines<R>,
	expected: u16,
) -> Result<(), RelayError> {
	loop {
		let line = timeout(REPLY_TIMEOUT, lines.next_line())
			.await
			.map_err(|_| RelayError::Timeout)??
			.ok_or(RelayError::Closed)?;

		if line.len() >= 4 && line.as_bytes()[3] == b'-' {
			continue;
		}

		let code: u16 = line
			.get(..3)
			.and_then(|code| code.parse().ok())
			.ok_or_else(|| RelayError::BadReply(line.clone()))?;

		if code != expected {
			return Err(RelayError::UnexpectedReply {
				expected,
				reply: line,
			});
		}

		return Ok(());
	}
}

/// Double leading dots and make sure the data ends in CRLF so the
/// terminating dot sits on its own line.
fn dot_stuff(data: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(data.len() + 16);
	let mut at_line_start = true;

	for &byte in data {
		if at_line_start && byte == b'.' {
			out.push(b'.');
		}
		out.push(byte);
		at_line_start = byte == b'\n';
	}

	if !out.ends_with(b"\r\n") {
		out.extend_from_slice(b"\r\n");
	}

	out
}
