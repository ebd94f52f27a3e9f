use thiserror::Error;

use crate::{alias::PeriodKind, config::Config};

pub type UserId = u64;
pub type GroupId = u64;
pub type ListId = u64;

/// A named group from the directory, matched against alias tokens by
/// its anchored regex pattern.
#[derive(Clone, Debug)]
pub struct GroupDef {
	pub id: GroupId,
	pub name: String,
	pub pattern: String,
}

#[derive(Error, Debug)]
pub enum DirectoryError {
	#[error("directory lookup failed: {0}")]
	Lookup(String),
}

/// One consistent view of the people directory. Alias resolution is
/// pure over a snapshot; two resolutions of the same expression against
/// the same snapshot give the same answer.
///
/// Identifiers are opaque to the resolver. Email address resolution is
/// separate from membership so that a person who refuses direct mail
/// still counts as a member.
pub trait DirectorySnapshot: Send + Sync {
	fn groups(&self) -> Result<Vec<GroupDef>, DirectoryError>;
	fn group_members(&self, id: GroupId) -> Result<Vec<UserId>, DirectoryError>;

	/// The title roots the generation grammar may wrap, e.g. FORM or
	/// KASS. A token is only a title if its core is one of these.
	fn title_roots(&self) -> Result<Vec<String>, DirectoryError>;
	fn users_by_title(&self, root: &str, period: i32) -> Result<Vec<UserId>, DirectoryError>;

	/// Board/committee members for a period. `BestFu` is the union of
	/// the other two kinds.
	fn period_members(&self, kind: PeriodKind, period: i32) -> Result<Vec<UserId>, DirectoryError>;

	fn user_exists(&self, id: UserId) -> Result<bool, DirectoryError>;

	/// Deliverable mailbox addresses for the given people. People who
	/// opted out of direct mail are silently absent from the result.
	fn email_addresses(&self, ids: &[UserId]) -> Result<Vec<String>, DirectoryError>;

	/// The internal-only mailing list with this name, if any.
	fn internal_list(&self, name: &str) -> Result<Option<ListId>, DirectoryError>;
	fn is_list_member(&self, address: &str, list: ListId) -> Result<bool, DirectoryError>;

	fn admin_emails(&self) -> Result<Vec<String>, DirectoryError>;

	/// The period new-style aliases without a generation marker refer to.
	fn current_period(&self) -> i32;
}

/// Administrator mailboxes, falling back to the configured static list
/// when the directory can't answer.
pub fn admin_emails(directory: &dyn DirectorySnapshot, config: &Config) -> Vec<String> {
	match directory.admin_emails() {
		Ok(emails) if !emails.is_empty() => emails,
		Ok(_) => config.fallback_admins.clone(),
		Err(error) => {
			tracing::warn!("directory admin lookup failed, using fallback: {}", error);
			config.fallback_admins.clone()
		}
	}
}

#[cfg(test)]
pub(crate) mod stub {
	use std::collections::HashMap;

	use super::*;

	/// In-memory directory for resolver and pipeline tests, roughly the
	/// 2013 board plus a couple of groups.
	pub struct StubDirectory {
		pub period: i32,
		pub groups: Vec<(GroupDef, Vec<UserId>)>,
		pub titles: HashMap<(String, i32), Vec<UserId>>,
		pub best: HashMap<i32, Vec<UserId>>,
		pub fu: HashMap<i32, Vec<UserId>>,
		pub emails: HashMap<UserId, String>,
		pub internal_lists: HashMap<String, (ListId, Vec<String>)>,
		pub admins: Vec<String>,
	}

	impl StubDirectory {
		pub fn new() -> Self {
			let mut stub = Self {
				period: 2013,
				groups: vec![],
				titles: HashMap::new(),
				best: HashMap::new(),
				fu: HashMap::new(),
				emails: HashMap::new(),
				internal_lists: HashMap::new(),
				admins: vec!["admin1@example.dk".into(), "admin2@example.dk".into()],
			};

			stub.add_group(1, "admin", "ADMIN(?:ISTRATOR(?:ERNE|EN)?)?", &[1, 2]);
			stub.add_group(2, "revy", "REVY(?:EN)?", &[2, 3, 4]);

			// the 2013 board: FORM is user 10, KASS user 11, ...
			stub.add_title("FORM", 2013, &[10]);
			stub.add_title("KASS", 2013, &[11]);
			stub.add_title("CERM", 2013, &[12]);
			stub.add_title("SEKR", 2013, &[13]);
			stub.add_title("NF", 2013, &[14]);
			stub.add_title("PR", 2013, &[15]);
			stub.add_title("VC", 2013, &[16]);
			stub.add_title("INKA", 2013, &[17]);
			stub.add_title("FORM", 2014, &[20]);
			stub.add_title("FORM", 2012, &[21]);
			stub.add_title("FUVE", 2013, &[30]);

			stub.best.insert(2013, vec![10, 11, 12, 13, 14, 15, 16, 17]);
			stub.best.insert(2012, vec![21, 22]);
			stub.fu.insert(2013, vec![30, 31, 32]);

			for id in [1, 2, 3, 4, 10, 11, 12, 13, 14, 15, 16, 17, 20, 21, 22, 30, 31, 32] {
				stub.emails.insert(id, format!("user{}@person.example.org", id));
			}

			stub
		}

		pub fn add_group(&mut self, id: GroupId, name: &str, pattern: &str, members: &[UserId]) {
			self.groups.push((
				GroupDef {
					id,
					name: name.into(),
					pattern: pattern.into(),
				},
				members.to_vec(),
			));
		}

		pub fn add_title(&mut self, root: &str, period: i32, members: &[UserId]) {
			self.titles.insert((root.into(), period), members.to_vec());
		}
	}

	impl DirectorySnapshot for StubDirectory {
		fn groups(&self) -> Result<Vec<GroupDef>, DirectoryError> {
			Ok(self.groups.iter().map(|(def, _)| def.clone()).collect())
		}

		fn group_members(&self, id: GroupId) -> Result<Vec<UserId>, DirectoryError> {
			Ok(self
				.groups
				.iter()
				.find(|(def, _)| def.id == id)
				.map(|(_, members)| members.clone())
				.unwrap_or_default())
		}

		fn title_roots(&self) -> Result<Vec<String>, DirectoryError> {
			let mut roots: Vec<String> =
				self.titles.keys().map(|(root, _)| root.clone()).collect();
			roots.sort();
			roots.dedup();
			Ok(roots)
		}

		fn users_by_title(&self, root: &str, period: i32) -> Result<Vec<UserId>, DirectoryError> {
			Ok(self
				.titles
				.get(&(root.to_string(), period))
				.cloned()
				.unwrap_or_default())
		}

		fn period_members(
			&self,
			kind: PeriodKind,
			period: i32,
		) -> Result<Vec<UserId>, DirectoryError> {
			let best = self.best.get(&period).cloned().unwrap_or_default();
			let fu = self.fu.get(&period).cloned().unwrap_or_default();

			Ok(match kind {
				PeriodKind::Best => best,
				PeriodKind::Fu => fu,
				PeriodKind::BestFu => best.into_iter().chain(fu).collect(),
			})
		}

		fn user_exists(&self, id: UserId) -> Result<bool, DirectoryError> {
			Ok(self.emails.contains_key(&id))
		}

		fn email_addresses(&self, ids: &[UserId]) -> Result<Vec<String>, DirectoryError> {
			Ok(ids
				.iter()
				.filter_map(|id| self.emails.get(id).cloned())
				.collect())
		}

		fn internal_list(&self, name: &str) -> Result<Option<ListId>, DirectoryError> {
			Ok(self.internal_lists.get(name).map(|(id, _)| *id))
		}

		fn is_list_member(&self, address: &str, list: ListId) -> Result<bool, DirectoryError> {
			Ok(self.internal_lists.values().any(|(id, members)| {
				*id == list && members.iter().any(|m| m.eq_ignore_ascii_case(address))
			}))
		}

		fn admin_emails(&self) -> Result<Vec<String>, DirectoryError> {
			Ok(self.admins.clone())
		}

		fn current_period(&self) -> i32 {
			self.period
		}
	}
}
