use super::{Domain, InvalidLocalPart, LocalPart, ParseDomainError};
use std::{
	fmt::{Display, Formatter},
	str::FromStr,
};
use thiserror::Error;

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct Address {
	pub local_part: LocalPart,
	pub domain: Domain,
}

impl Address {
	pub fn new(local: LocalPart, domain: Domain) -> Self {
		Self {
			local_part: local,
			domain,
		}
	}

	/// Parse the `<local@domain>` form used by MAIL and RCPT arguments.
	pub fn from_bracketed(s: &str) -> Result<Self, ParseAddressError> {
		s.strip_prefix('<')
			.and_then(|s| s.strip_suffix('>'))
			.ok_or(ParseAddressError::Brackets)?
			.parse()
	}
}

impl Display for Address {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@{}", self.local_part, self.domain)
	}
}

impl FromStr for Address {
	type Err = ParseAddressError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if let Some((local_part, domain)) = s.rsplit_once('@') {
			// Check if it's an address literal first, and if it isn't, check if it's a domain
			Ok(Self {
				local_part: local_part.parse()?,
				domain: domain.parse()?,
			})
		} else {
			Err(ParseAddressError::NoAtSign)
		}
	}
}

#[derive(Clone, Debug)]
pub enum ReversePath {
	Null,
	Regular(Address),
}

impl ReversePath {
	pub fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}
}

impl Display for ReversePath {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Null => write!(f, "<>"),
			Self::Regular(address) => write!(f, "<{}>", address),
		}
	}
}

impl FromStr for ReversePath {
	type Err = ParseAddressError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s == "<>" {
			Ok(Self::Null)
		} else {
			Ok(Self::Regular(Address::from_bracketed(s)?))
		}
	}
}

impl Default for ReversePath {
	fn default() -> Self {
		Self::Null
	}
}

#[derive(Error, Debug)]
pub enum ParseAddressError {
	#[error("no enclosing angle brackets")]
	Brackets,
	#[error("no @")]
	NoAtSign,
	#[error("invalid local part")]
	InvalidLocalPart(#[from] InvalidLocalPart),
	#[error("invalid domain")]
	InvalidDomain(#[from] ParseDomainError),
}
