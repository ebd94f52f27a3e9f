//! Every message we don't forward is kept on disk: the raw bytes, a
//! JSON metadata record, and a plain-text description. Nothing is ever
//! silently dropped; an administrator can always replay an archived
//! mail by hand.

use std::{io::Write, path::PathBuf};

use gethostname::gethostname;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use time::{macros::format_description, OffsetDateTime};

use ferry::{config::Config, report, report::DeliveryReport};

#[derive(Error, Debug)]
pub enum ArchiveError {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("could not serialize metadata: {0}")]
	Json(#[from] serde_json::Error),
	#[error("could not format the timestamp: {0}")]
	Time(#[from] time::error::Format),
}

/// What we know about an archived envelope. For absorbed delivery
/// reports this describes the *undelivered* mail, not the report
/// around it.
#[derive(Serialize)]
pub struct ArchiveEntry {
	pub mailfrom: String,
	pub rcpttos: Vec<String>,
	pub subject: Option<String>,
	pub date: Option<String>,
	pub summary: String,
	/// Per-recipient records when the archived mail was a delivery
	/// report; rejects and failures carry none.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub report: Option<DeliveryReport>,
	#[serde(skip)]
	pub description: String,
}

pub struct FsArchive {
	dir: PathBuf,
}

impl FsArchive {
	pub fn new<B: Into<PathBuf>>(dir: B) -> Self {
		Self { dir: dir.into() }
	}

	/// Write `<stamp>.mail`, `<stamp>.json` and `<stamp>.txt`, creating
	/// the archive directory if needed, and return the stamp.
	pub fn store(&self, entry: &ArchiveEntry, raw: &[u8]) -> Result<String, ArchiveError> {
		std::fs::create_dir_all(&self.dir)?;
		let stamp = Self::unique_stamp()?;

		let mut mail = std::fs::File::create(self.dir.join(format!("{}.mail", stamp)))?;
		mail.write_all(raw)?;

		let mut json = std::fs::File::create(self.dir.join(format!("{}.json", stamp)))?;
		json.write_all(&serde_json::to_vec_pretty(entry)?)?;

		let mut txt = std::fs::File::create(self.dir.join(format!("{}.txt", stamp)))?;
		txt.write_all(entry.description.as_bytes())?;
		txt.write_all(b"\n")?;

		Ok(stamp)
	}

	/// Re-parse every archived `.mail` file as a delivery report and
	/// log the outcome. A malformed report is logged and skipped, it
	/// never stops the scan.
	pub fn scan(&self, config: &Config) -> std::io::Result<()> {
		let mut names: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
			.filter_map(|entry| entry.ok().map(|e| e.path()))
			.filter(|path| path.extension().map(|ext| ext == "mail").unwrap_or(false))
			.collect();
		names.sort();

		for path in names {
			let raw = std::fs::read(&path)?;
			let message = ferry::message::Message::new(raw);

			match report::parse_delivery_report(&message, config) {
				Ok(Some(parsed)) => {
					tracing::info!("{}: {}", path.display(), parsed.notification)
				}
				Ok(None) => tracing::info!("{}: not a delivery report", path.display()),
				Err(error) => tracing::warn!("{}: {}", path.display(), error),
			}
		}

		Ok(())
	}

	fn unique_stamp() -> Result<String, ArchiveError> {
		let format =
			format_description!("[year]-[month]-[day]_[hour]-[minute]-[second].[subsecond digits:6]");
		let now = OffsetDateTime::now_utc().format(&format)?;

		let middle: u32 = rand::thread_rng().gen();
		let hostname = gethostname().to_string_lossy().replace('/', "-");

		Ok(format!("{}.{:08x}.{}", now, middle, hostname))
	}
}
