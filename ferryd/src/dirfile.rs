//! A directory snapshot read from a confindent file. Small deployments
//! keep the whole membership in one file next to the daemon config;
//! the daemon reads it once at startup.
//!
//! ```text
//! Period 2013
//! Admins admin1@example.dk,admin2@example.dk
//!
//! User 10
//! 	Email form@person.example.org
//!
//! Group revy
//! 	Pattern REVY(?:EN)?
//! 	Members 2,3,4
//!
//! Group hemmelig
//! 	Pattern HEMMELIG
//! 	Members 3
//! 	Internal boss@member.example.org
//!
//! Title FORM
//! 	Holders 2013 10
//! 	Holders 2014 20
//!
//! Best 2013
//! 	Members 10,11
//! Fu 2013
//! 	Members 30
//! ```

use std::{collections::HashMap, path::Path, str::FromStr};

use confindent::Confindent;
use thiserror::Error;

use ferry::{
	alias::PeriodKind,
	directory::{DirectoryError, DirectorySnapshot, GroupDef, GroupId, ListId, UserId},
};

#[derive(Error, Debug)]
pub enum DirfileError {
	#[error("could not read the directory file: {0}")]
	Read(String),
	#[error("missing required key {0}")]
	Missing(&'static str),
	#[error("could not parse '{0}' as a number")]
	BadNumber(String),
}

struct FileGroup {
	def: GroupDef,
	members: Vec<UserId>,
	/// Set when only these outside addresses (and anyone at the org
	/// domain) may post to the group.
	internal: Option<Vec<String>>,
}

pub struct FileDirectory {
	period: i32,
	admins: Vec<String>,
	user_ids: Vec<UserId>,
	emails: HashMap<UserId, String>,
	groups: Vec<FileGroup>,
	titles: HashMap<String, HashMap<i32, Vec<UserId>>>,
	best: HashMap<i32, Vec<UserId>>,
	fu: HashMap<i32, Vec<UserId>>,
}

impl FileDirectory {
	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DirfileError> {
		let conf =
			Confindent::from_file(path).map_err(|error| DirfileError::Read(error.to_string()))?;

		Self::from_conf(&conf)
	}

	fn from_conf(conf: &Confindent) -> Result<Self, DirfileError> {
		let period = number(conf.child_value("Period").ok_or(DirfileError::Missing("Period"))?)?;
		let admins = comma_list(conf.child_value("Admins"));

		let mut user_ids = vec![];
		let mut emails = HashMap::new();
		for user in conf.children("User") {
			let id: UserId = number(user.value().ok_or(DirfileError::Missing("User"))?)?;
			user_ids.push(id);

			// users without an Email refuse direct mail but still count
			// as members
			if let Some(email) = user.child_value("Email") {
				emails.insert(id, email.to_string());
			}
		}

		let mut groups = vec![];
		for (index, group) in conf.children("Group").into_iter().enumerate() {
			let name = group.value().ok_or(DirfileError::Missing("Group"))?.to_string();
			let pattern = group
				.child_value("Pattern")
				.ok_or(DirfileError::Missing("Pattern"))?
				.to_string();

			groups.push(FileGroup {
				def: GroupDef {
					id: index as GroupId,
					name,
					pattern,
				},
				members: id_list(group.child_value("Members"))?,
				internal: group.child("Internal").map(|node| comma_list(node.value())),
			});
		}

		let mut titles: HashMap<String, HashMap<i32, Vec<UserId>>> = HashMap::new();
		for title in conf.children("Title") {
			let root = title
				.value()
				.ok_or(DirfileError::Missing("Title"))?
				.to_uppercase();
			let by_period = titles.entry(root).or_default();

			for holders in title.children("Holders") {
				let value = holders.value().ok_or(DirfileError::Missing("Holders"))?;
				let (period, ids) = value
					.split_once(' ')
					.ok_or(DirfileError::Missing("Holders"))?;

				by_period.insert(number(period)?, id_list(Some(ids))?);
			}
		}

		let mut best = HashMap::new();
		for node in conf.children("Best") {
			let period = number(node.value().ok_or(DirfileError::Missing("Best"))?)?;
			best.insert(period, id_list(node.child_value("Members"))?);
		}

		let mut fu = HashMap::new();
		for node in conf.children("Fu") {
			let period = number(node.value().ok_or(DirfileError::Missing("Fu"))?)?;
			fu.insert(period, id_list(node.child_value("Members"))?);
		}

		Ok(Self {
			period,
			admins,
			user_ids,
			emails,
			groups,
			titles,
			best,
			fu,
		})
	}
}

fn number<T: FromStr>(value: &str) -> Result<T, DirfileError> {
	value
		.trim()
		.parse()
		.map_err(|_| DirfileError::BadNumber(value.to_string()))
}

fn comma_list(value: Option<&str>) -> Vec<String> {
	value
		.map(|joined| {
			joined
				.split(',')
				.map(|part| part.trim().to_string())
				.filter(|part| !part.is_empty())
				.collect()
		})
		.unwrap_or_default()
}

fn id_list(value: Option<&str>) -> Result<Vec<UserId>, DirfileError> {
	comma_list(value).iter().map(|id| number(id)).collect()
}

impl DirectorySnapshot for FileDirectory {
	fn groups(&self) -> Result<Vec<GroupDef>, DirectoryError> {
		Ok(self.groups.iter().map(|group| group.def.clone()).collect())
	}

	fn group_members(&self, id: GroupId) -> Result<Vec<UserId>, DirectoryError> {
		Ok(self
			.groups
			.iter()
			.find(|group| group.def.id == id)
			.map(|group| group.members.clone())
			.unwrap_or_default())
	}

	fn title_roots(&self) -> Result<Vec<String>, DirectoryError> {
		let mut roots: Vec<String> = self.titles.keys().cloned().collect();
		roots.sort();
		Ok(roots)
	}

	fn users_by_title(&self, root: &str, period: i32) -> Result<Vec<UserId>, DirectoryError> {
		Ok(self
			.titles
			.get(root)
			.and_then(|by_period| by_period.get(&period))
			.cloned()
			.unwrap_or_default())
	}

	fn period_members(&self, kind: PeriodKind, period: i32) -> Result<Vec<UserId>, DirectoryError> {
		let best = self.best.get(&period).cloned().unwrap_or_default();
		let fu = self.fu.get(&period).cloned().unwrap_or_default();

		Ok(match kind {
			PeriodKind::Best => best,
			PeriodKind::Fu => fu,
			PeriodKind::BestFu => best.into_iter().chain(fu).collect(),
		})
	}

	fn user_exists(&self, id: UserId) -> Result<bool, DirectoryError> {
		Ok(self.user_ids.contains(&id))
	}

	fn email_addresses(&self, ids: &[UserId]) -> Result<Vec<String>, DirectoryError> {
		Ok(ids
			.iter()
			.filter_map(|id| self.emails.get(id).cloned())
			.collect())
	}

	fn internal_list(&self, name: &str) -> Result<Option<ListId>, DirectoryError> {
		Ok(self
			.groups
			.iter()
			.find(|group| group.internal.is_some() && group.def.name.eq_ignore_ascii_case(name))
			.map(|group| group.def.id as ListId))
	}

	fn is_list_member(&self, address: &str, list: ListId) -> Result<bool, DirectoryError> {
		Ok(self
			.groups
			.iter()
			.find(|group| group.def.id as ListId == list)
			.and_then(|group| group.internal.as_ref())
			.map(|members| {
				members
					.iter()
					.any(|member| member.eq_ignore_ascii_case(address))
			})
			.unwrap_or(false))
	}

	fn admin_emails(&self) -> Result<Vec<String>, DirectoryError> {
		Ok(self.admins.clone())
	}

	fn current_period(&self) -> i32 {
		self.period
	}
}
