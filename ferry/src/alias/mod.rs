mod grammar;

pub use grammar::{get_period, match_direct_user, match_period, match_title, normalize, tokenize};
pub use grammar::{Generation, InvalidPeriod, Sign};

use std::{collections::BTreeMap, fmt::Display};

use regex::Regex;
use thiserror::Error;

use crate::directory::{DirectoryError, DirectorySnapshot, GroupDef, UserId};

/// Which slice of the membership a period alias names: the board, the
/// committee, or both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodKind {
	Best,
	Fu,
	BestFu,
}

impl Display for PeriodKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Best => write!(f, "BEST"),
			Self::Fu => write!(f, "FU"),
			Self::BestFu => write!(f, "BESTFU"),
		}
	}
}

/// Where a resolved member came from. Under the left-to-right algebra
/// the last alias that added a person owns them, so every member of a
/// resolution carries exactly one of these.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AliasDescriptor {
	Group { name: String },
	Period { kind: PeriodKind, period: i32 },
	Title { root: String, period: i32 },
	DirectUser { id: UserId },
}

impl AliasDescriptor {
	pub fn is_group(&self) -> bool {
		matches!(self, Self::Group { .. })
	}

	/// The name outbound list headers use for this alias.
	pub fn list_name(&self) -> String {
		self.to_string().to_lowercase()
	}
}

impl Display for AliasDescriptor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Group { name } => write!(f, "{}", name),
			Self::Period { kind, period } => write!(f, "{}{}", kind, period),
			Self::Title { root, period } => write!(f, "{}{}", root, period),
			Self::DirectUser { id } => write!(f, "DIRECTUSER{}", id),
		}
	}
}

/// The outcome of resolving one alias expression: an identifier-ordered
/// set of people, each tagged with the alias that contributed them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
	members: BTreeMap<UserId, AliasDescriptor>,
}

impl Resolution {
	pub fn ids(&self) -> Vec<UserId> {
		self.members.keys().copied().collect()
	}

	pub fn members(&self) -> impl Iterator<Item = (UserId, &AliasDescriptor)> {
		self.members.iter().map(|(id, descriptor)| (*id, descriptor))
	}

	/// Members regrouped by their owning descriptor. Every identifier
	/// lands in exactly one group.
	pub fn by_descriptor(&self) -> BTreeMap<AliasDescriptor, Vec<UserId>> {
		let mut groups: BTreeMap<AliasDescriptor, Vec<UserId>> = BTreeMap::new();
		for (id, descriptor) in &self.members {
			groups.entry(descriptor.clone()).or_default().push(*id);
		}
		groups
	}

	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}
}

#[derive(Error, Debug)]
pub enum ResolveError {
	/// One or more tokens didn't name anyone. All bad tokens of the
	/// expression are collected before this is returned.
	#[error("invalid recipient: {}", .0.join(", "))]
	InvalidRecipient(Vec<String>),
	/// Directory data problem, not a user error: two group patterns
	/// matched the same token.
	#[error("alias {0} matches more than one group pattern")]
	AmbiguousAlias(String),
	#[error("invalid group pattern {pattern}: {source}")]
	BadGroupPattern {
		pattern: String,
		source: regex::Error,
	},
	#[error(transparent)]
	Directory(#[from] DirectoryError),
}

enum Lookup {
	Resolved(Vec<UserId>, AliasDescriptor),
	Invalid(String),
}

/// Resolve an alias expression to people.
///
/// The expression is uppercased, split into signed tokens, and each
/// token is matched in fixed order: group pattern, period kind, title,
/// direct user. Tokens apply left to right; a plus inserts every
/// member with the token's descriptor (overwriting any earlier
/// descriptor for that person), a minus removes them. An expression
/// whose final set is empty is as invalid as one with unknown tokens.
pub fn resolve(
	expression: &str,
	directory: &dyn DirectorySnapshot,
) -> Result<Resolution, ResolveError> {
	let normalized = normalize(expression);
	let groups = compile_groups(&directory.groups()?)?;
	let roots = directory.title_roots()?;

	let mut operations = vec![];
	let mut invalid = vec![];
	for (sign, token) in tokenize(&normalized) {
		match lookup(&token, directory, &groups, &roots)? {
			Lookup::Resolved(ids, descriptor) => operations.push((sign, ids, descriptor)),
			Lookup::Invalid(token) => invalid.push(token),
		}
	}

	if !invalid.is_empty() {
		return Err(ResolveError::InvalidRecipient(invalid));
	}

	let mut members = BTreeMap::new();
	for (sign, ids, descriptor) in operations {
		match sign {
			Sign::Plus => {
				for id in ids {
					members.insert(id, descriptor.clone());
				}
			}
			Sign::Minus => {
				for id in ids {
					members.remove(&id);
				}
			}
		}
	}

	if members.is_empty() {
		return Err(ResolveError::InvalidRecipient(vec![normalized]));
	}

	Ok(Resolution { members })
}

fn compile_groups(groups: &[GroupDef]) -> Result<Vec<(Regex, GroupDef)>, ResolveError> {
	groups
		.iter()
		.map(|def| {
			Regex::new(&format!("^(?:{})$", def.pattern))
				.map(|re| (re, def.clone()))
				.map_err(|source| ResolveError::BadGroupPattern {
					pattern: def.pattern.clone(),
					source,
				})
		})
		.collect()
}

fn lookup(
	token: &str,
	directory: &dyn DirectorySnapshot,
	groups: &[(Regex, GroupDef)],
	roots: &[String],
) -> Result<Lookup, ResolveError> {
	if let Some(def) = match_group(token, groups)? {
		let ids = directory.group_members(def.id)?;
		return Ok(resolved(ids, AliasDescriptor::Group { name: def.name.clone() }, token));
	}

	if let Some((kind, generation)) = match_period(token) {
		return match get_period(
			&generation.prefix,
			&generation.postfix,
			directory.current_period(),
		) {
			Ok(period) => {
				let ids = directory.period_members(kind, period)?;
				Ok(resolved(ids, AliasDescriptor::Period { kind, period }, token))
			}
			Err(InvalidPeriod) => Ok(Lookup::Invalid(generation.postfix)),
		};
	}

	if let Some((root, generation)) = match_title(token, roots) {
		return match get_period(
			&generation.prefix,
			&generation.postfix,
			directory.current_period(),
		) {
			Ok(period) => {
				let ids = directory.users_by_title(&root, period)?;
				Ok(resolved(ids, AliasDescriptor::Title { root, period }, token))
			}
			Err(InvalidPeriod) => Ok(Lookup::Invalid(generation.postfix)),
		};
	}

	if let Some(id) = match_direct_user(token) {
		if directory.user_exists(id)? {
			return Ok(Lookup::Resolved(vec![id], AliasDescriptor::DirectUser { id }));
		}
		return Ok(Lookup::Invalid(token.to_string()));
	}

	Ok(Lookup::Invalid(token.to_string()))
}

// a recognized shape that names nobody is as unknown as gibberish
fn resolved(ids: Vec<UserId>, descriptor: AliasDescriptor, token: &str) -> Lookup {
	if ids.is_empty() {
		Lookup::Invalid(token.to_string())
	} else {
		Lookup::Resolved(ids, descriptor)
	}
}

fn match_group<'g>(
	token: &str,
	groups: &'g [(Regex, GroupDef)],
) -> Result<Option<&'g GroupDef>, ResolveError> {
	let mut matched = None;
	for (re, def) in groups {
		if re.is_match(token) {
			if matched.is_some() {
				return Err(ResolveError::AmbiguousAlias(token.to_string()));
			}
			matched = Some(def);
		}
	}

	Ok(matched)
}
