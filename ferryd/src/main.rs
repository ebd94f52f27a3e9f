mod archive;
mod binconfig;
mod dirfile;
mod dmarc;
mod net;
mod process;
mod relay;
mod session;

use std::sync::Arc;

use hickory_resolver::TokioAsyncResolver;
use tokio::{
	net::TcpListener,
	sync::{mpsc, watch},
};

use archive::FsArchive;
use binconfig::BinConfig;
use dirfile::FileDirectory;
use process::Processor;

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt::init();

	let binconf = match BinConfig::get() {
		Some(conf) => conf,
		None => return,
	};

	let archive = FsArchive::new(&binconf.archive_dir);

	if binconf.scan_archive {
		if let Err(error) = archive.scan(&binconf.core) {
			tracing::error!("archive scan failed: {}", error);
		}
		return;
	}

	let directory = match FileDirectory::from_file(&binconf.directory_file) {
		Ok(directory) => Arc::new(directory),
		Err(error) => {
			tracing::error!(
				"could not load the directory from {}: {}",
				binconf.directory_file.display(),
				error
			);
			return;
		}
	};

	let listener = match TcpListener::bind(binconf.socket_address()).await {
		Ok(listener) => listener,
		Err(error) => {
			tracing::error!("could not bind {}: {}", binconf.socket_address(), error);
			return;
		}
	};
	tracing::info!("listening on {}", binconf.socket_address());

	let resolver = TokioAsyncResolver::tokio(Default::default(), Default::default());

	let binconf = Arc::new(binconf);
	let (tx, rx) = watch::channel(false);
	let (envelope_sender, envelope_receiver) = mpsc::unbounded_channel();

	let processor = Processor::new(binconf.clone(), directory, archive, resolver);
	let process_task = tokio::spawn(processor.run(envelope_receiver, rx.clone()));
	let listen_task = tokio::spawn(net::listen(listener, envelope_sender, binconf, rx));

	let signal_listener = tokio::spawn(async {
		use tokio::signal::unix::{signal, SignalKind};
		let mut signals = (
			tokio::signal::ctrl_c(),
			signal(SignalKind::hangup()).unwrap(),
			signal(SignalKind::terminate()).unwrap(),
		);
		tokio::select! {
			_ = signals.0 => (),
			_ = signals.1.recv() => (),
			_ = signals.2.recv() => ()
		};
	});

	#[allow(unused_must_use)]
	{
		signal_listener.await;
		tracing::info!("received shutdown signal, beginning graceful shutdown");
		tx.send(true);
		tokio::join!(listen_task, process_task);
	}
}
