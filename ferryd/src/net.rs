use std::sync::Arc;

use ferry::envelope::Envelope;
use tokio::{
	io::{self, AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	sync::{mpsc, watch},
};

use crate::{binconfig::BinConfig, session::Session};

// runs as long as the client remains connected. handles the tcp read
// and write nonsense; the SMTP itself lives in Session.
async fn serve(
	mut stream: TcpStream,
	envelope_sender: mpsc::UnboundedSender<Envelope>,
	config: Arc<BinConfig>,
	mut rx: watch::Receiver<bool>,
) -> io::Result<()> {
	let (mut session, greeting) = Session::initiate(envelope_sender, config);
	stream.write_all(greeting.as_string().as_bytes()).await?;

	let mut buf = vec![0; 1024];

	while !session.should_exit() {
		let read = tokio::select! {
			Ok(read) = stream.read(&mut buf) => read,
			_ = rx.changed() => {
				let _ = stream.write_all(b"421 Service shutting down\r\n").await;
				return Ok(());
			},
		};

		// A zero sized read, this connection has died or been terminated by the client
		if read == 0 {
			tracing::debug!("connection closed by client");
			return Ok(());
		}

		let reply = session.push(String::from_utf8_lossy(&buf[..read]).as_ref());

		if let Some(reply) = reply {
			stream.write_all(reply.as_string().as_bytes()).await?;
		}
	}

	Ok(())
}

// waits for new connections, dispatches a task to handle each one
pub async fn listen(
	listener: TcpListener,
	envelope_sender: mpsc::UnboundedSender<Envelope>,
	config: Arc<BinConfig>,
	mut rx: watch::Receiver<bool>,
) {
	loop {
		let (stream, clientaddr) = tokio::select! {
			_ = rx.changed() => break,
			Ok((stream, clientaddr)) = listener.accept() => (stream, clientaddr)
		};

		tracing::debug!("connection from {}", clientaddr);

		tokio::spawn(serve(
			stream,
			envelope_sender.clone(),
			config.clone(),
			rx.clone(),
		));
	}
}
