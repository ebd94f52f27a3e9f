use std::{
	net::{IpAddr, SocketAddr},
	path::PathBuf,
};

use confindent::Confindent;
use ferry::config::Config;
use gethostname::gethostname;
use getopts::Options;

pub struct BinConfig {
	pub address: IpAddr,
	pub port: u16,
	pub relay_address: String,
	pub relay_port: u16,
	pub archive_dir: PathBuf,
	pub directory_file: PathBuf,
	pub scan_archive: bool,
	pub hostname: String,
	pub core: Config,
}

#[allow(clippy::or_fun_call)]
impl BinConfig {
	fn print_usage<S: AsRef<str>>(prgm: S, opts: &Options) {
		let brief = format!("Usage: {} [options]", prgm.as_ref());
		println!("{}", opts.usage(&brief));
	}

	pub fn socket_address(&self) -> SocketAddr {
		SocketAddr::new(self.address, self.port)
	}

	pub fn get() -> Option<Self> {
		let args: Vec<String> = std::env::args().collect();

		let mut opts = Options::new();
		opts.optflag("h", "help", "Print this help message");
		opts.optopt(
			"l",
			"listen-address",
			"The IP address ferryd will listen for incoming connections on\nDefault: 127.0.0.1",
			"IP_ADDR",
		);
		opts.optopt(
			"p",
			"port",
			"The port ferryd will listen on\nDefault: 9000",
			"PORT",
		);
		opts.optopt(
			"r",
			"relay-address",
			"The host accepted mail is handed to\nDefault: 127.0.0.1",
			"HOST",
		);
		opts.optopt(
			"",
			"relay-port",
			"The port on the relay host\nDefault: 25",
			"PORT",
		);
		opts.optopt(
			"d",
			"directory",
			"The membership directory file\nDefault: /etc/ferryd/directory.conf",
			"PATH",
		);
		opts.optopt(
			"a",
			"archive",
			"Where rejected and failed mail is kept\nDefault: /var/lib/ferryd/archive",
			"PATH",
		);
		opts.optflag(
			"",
			"enforce-dmarc",
			"Reject unsigned mail from strict-DMARC sender domains",
		);
		opts.optflag(
			"",
			"scan-archive",
			"Re-parse archived mail as delivery reports and exit",
		);
		opts.optopt(
			"c",
			"config",
			"An alternate location to read the config from\nDefault: /etc/ferryd/ferryd.conf",
			"PATH",
		);

		let matches = match opts.parse(&args[1..]) {
			Ok(m) => m,
			Err(_e) => return None,
		};

		if matches.opt_present("help") {
			Self::print_usage(&args[0], &opts);
			return None;
		}

		let conf_path = matches
			.opt_str("config")
			.unwrap_or("/etc/ferryd/ferryd.conf".into());

		let config = match Confindent::from_file(conf_path) {
			Ok(c) => c,
			Err(_) => match Confindent::from_file("ferryd.conf") {
				Ok(c) => c,
				Err(err) => {
					eprintln!("failed to parse conf file: {}", err);
					return None;
				}
			},
		};

		// Options specified on the command line take priority. We only take the
		// cli_key and convert to the config key internally so that we can remain
		// consistent.
		let find_value = |cli_key: &str| -> Option<String> {
			let conf_key: String = cli_key
				.split('-')
				.map(|word| {
					let mut c = word.chars();
					match c.next() {
						None => String::new(),
						Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
					}
				})
				.collect();

			matches
				.opt_str(cli_key)
				.or(config.child_value(conf_key).map(|s| s.into()))
		};

		let address_string = find_value("listen-address").unwrap_or("127.0.0.1".into());
		let address = match address_string.parse() {
			Ok(addr) => addr,
			Err(_e) => {
				eprintln!("Failed to parse '{}' as an IP Address", address_string);
				return None;
			}
		};

		let port_string = find_value("port").unwrap_or("9000".into());
		let port = match port_string.parse() {
			Ok(p) => p,
			Err(_e) => {
				eprintln!("Failed to parse '{}' as a port", port_string);
				return None;
			}
		};

		let relay_address = find_value("relay-address").unwrap_or("127.0.0.1".into());
		let relay_port_string = find_value("relay-port").unwrap_or("25".into());
		let relay_port = match relay_port_string.parse() {
			Ok(p) => p,
			Err(_e) => {
				eprintln!("Failed to parse '{}' as a port", relay_port_string);
				return None;
			}
		};

		let domain = match config.child_value("Domain") {
			Some(domain) => domain.to_string(),
			None => {
				eprintln!("'Domain' not found in config. Whose mail are we handling?");
				return None;
			}
		};

		let admin_local = config.child_value("Admin").unwrap_or("admin").to_string();
		let sender = config
			.child_value("Sender")
			.map(String::from)
			.unwrap_or(format!("{}@{}", admin_local, domain));

		let comma_list = |key: &str| -> Vec<String> {
			config
				.child_value(key)
				.map(|joined| {
					joined
						.split(',')
						.map(|part| part.trim().to_string())
						.filter(|part| !part.is_empty())
						.collect()
				})
				.unwrap_or_default()
		};

		let enforce_dmarc = matches.opt_present("enforce-dmarc")
			|| config
				.child_value("EnforceDmarc")
				.map(|value| value == "true")
				.unwrap_or(false);

		let core = Config {
			domain,
			admin_local,
			sender,
			report_senders: comma_list("ReportSenders"),
			list_markers: comma_list("ListMarkers"),
			fallback_admins: comma_list("FallbackAdmins"),
			enforce_dmarc,
		};

		Some(Self {
			address,
			port,
			relay_address,
			relay_port,
			archive_dir: find_value("archive")
				.unwrap_or("/var/lib/ferryd/archive".into())
				.into(),
			directory_file: find_value("directory")
				.unwrap_or("/etc/ferryd/directory.conf".into())
				.into(),
			scan_archive: matches.opt_present("scan-archive"),
			hostname: gethostname().to_string_lossy().replace('/', "-"),
			core,
		})
	}

	#[cfg(test)]
	pub fn test() -> Self {
		Self {
			address: "127.0.0.1".parse().unwrap(),
			port: 9000,
			relay_address: "127.0.0.1".into(),
			relay_port: 25,
			archive_dir: "/tmp/ferry-archive".into(),
			directory_file: "/tmp/ferry-directory.conf".into(),
			scan_archive: false,
			hostname: "relay.example.dk".into(),
			core: Config {
				domain: "example.dk".into(),
				admin_local: "admin".into(),
				sender: "admin@example.dk".into(),
				report_senders: vec!["MAILER-DAEMON@relay.example.dk".into()],
				list_markers: vec!["list.example.dk".into()],
				fallback_admins: vec!["root@relay.example.dk".into()],
				enforce_dmarc: false,
			},
		}
	}
}
