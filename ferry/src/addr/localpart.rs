use std::{fmt::Display, str::FromStr};

use thiserror::Error;

use super::Validator;

/// The part of an address before the `@`. Kept verbatim; SMTP local
/// parts are case-sensitive even though almost nothing treats them so.
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct LocalPart(String);

impl LocalPart {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Display for LocalPart {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for LocalPart {
	type Err = InvalidLocalPart;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if Validator::validate_local_part(s) {
			Ok(Self(s.into()))
		} else {
			Err(InvalidLocalPart)
		}
	}
}

#[derive(Error, Debug)]
#[error("invalid local part")]
pub struct InvalidLocalPart;
