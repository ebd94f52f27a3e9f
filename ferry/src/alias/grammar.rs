use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use super::PeriodKind;
use crate::directory::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sign {
	Plus,
	Minus,
}

/// Split an alias expression into signed tokens. A leading sign is
/// optional and defaults to plus; empty names between signs are
/// dropped.
pub fn tokenize(expression: &str) -> Vec<(Sign, String)> {
	let mut tokens = vec![];
	let mut sign = Sign::Plus;
	let mut name = String::new();

	for ch in expression.chars() {
		match ch {
			'+' | '-' => {
				if !name.is_empty() {
					tokens.push((sign, std::mem::take(&mut name)));
				}
				sign = if ch == '+' { Sign::Plus } else { Sign::Minus };
			}
			_ => name.push(ch),
		}
	}
	if !name.is_empty() {
		tokens.push((sign, name));
	}

	tokens
}

/// Uppercase and map `$` to `S` before matching, so ka$$ finds the
/// treasurer too.
pub fn normalize(expression: &str) -> String {
	expression.to_uppercase().replace('$', "S")
}

/// The generation decoration around a period kind or title root:
/// an optional seniority prefix and an optional 2- or 4-digit year.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
	pub prefix: String,
	pub postfix: String,
}

fn period_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(r"^([KGBOT][KGBOT0-9]*)?(BESTFU|BEST|FU)([0-9]{2}|[0-9]{4})?$").unwrap()
	})
}

pub fn match_period(token: &str) -> Option<(PeriodKind, Generation)> {
	let caps = period_re().captures(token)?;

	let kind = match &caps[2] {
		"BEST" => PeriodKind::Best,
		"FU" => PeriodKind::Fu,
		_ => PeriodKind::BestFu,
	};

	Some((
		kind,
		Generation {
			prefix: caps.get(1).map(|m| m.as_str().into()).unwrap_or_default(),
			postfix: caps.get(3).map(|m| m.as_str().into()).unwrap_or_default(),
		},
	))
}

/// Match the generation grammar around one of the directory's title
/// roots. The root list keeps arbitrary words (DIRECTUSER42 among
/// them) from being read as titles.
pub fn match_title(token: &str, roots: &[String]) -> Option<(String, Generation)> {
	if roots.is_empty() {
		return None;
	}

	let alternation = roots
		.iter()
		.map(|root| regex::escape(root))
		.collect::<Vec<_>>()
		.join("|");
	let re = Regex::new(&format!(
		r"^([KGBOT][KGBOT0-9]*)?({})([0-9]{{2}}|[0-9]{{4}})?$",
		alternation
	))
	.ok()?;
	let caps = re.captures(token)?;

	Some((
		caps[2].to_string(),
		Generation {
			prefix: caps.get(1).map(|m| m.as_str().into()).unwrap_or_default(),
			postfix: caps.get(3).map(|m| m.as_str().into()).unwrap_or_default(),
		},
	))
}

pub fn match_direct_user(token: &str) -> Option<UserId> {
	let digits = token.strip_prefix("DIRECTUSER")?;

	if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}

	digits.parse().ok()
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid generation postfix")]
pub struct InvalidPeriod;

fn prefix_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"([KGBOT])([0-9]*)").unwrap())
}

/// Turn a generation prefix/postfix pair into an absolute period.
///
/// The postfix names a base year: empty means the current period, two
/// digits pivot at 56 (57 is 1957, 56 is 2056), four digits are either
/// a consecutive year pair (1314 is the year starting 2013) or a
/// literal 19xx/20xx year. The prefix then steps backwards by the
/// summed seniority weights: K is -1, G is 1, B is 2, O is 3, T is 1,
/// each optionally repeated by a trailing count (G2 is two Gs).
pub fn get_period(prefix: &str, postfix: &str, current_period: i32) -> Result<i32, InvalidPeriod> {
	let period = if postfix.is_empty() {
		current_period
	} else if postfix.len() == 2 {
		let yy: i32 = postfix.parse().map_err(|_| InvalidPeriod)?;
		pivot(yy)
	} else {
		let first: i32 = postfix[..2].parse().map_err(|_| InvalidPeriod)?;
		let second: i32 = postfix[2..].parse().map_err(|_| InvalidPeriod)?;

		if second == (first + 1) % 100 {
			pivot(first)
		} else if postfix.starts_with("19") || postfix.starts_with("20") {
			postfix.parse().map_err(|_| InvalidPeriod)?
		} else {
			return Err(InvalidPeriod);
		}
	};

	let mut grad = 0;
	for caps in prefix_re().captures_iter(prefix) {
		let weight = match &caps[1] {
			"K" => -1,
			"G" => 1,
			"B" => 2,
			"O" => 3,
			_ => 1, // T
		};
		let count: i32 = match &caps[2] {
			"" => 1,
			digits => digits.parse().map_err(|_| InvalidPeriod)?,
		};
		grad += weight * count;
	}

	Ok(period - grad)
}

fn pivot(yy: i32) -> i32 {
	if yy > 56 {
		1900 + yy
	} else {
		2000 + yy
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn tokenize_signs() {
		assert_eq!(
			tokenize("A+B-C"),
			vec![
				(Sign::Plus, "A".to_string()),
				(Sign::Plus, "B".to_string()),
				(Sign::Minus, "C".to_string()),
			]
		);
	}

	#[test]
	fn tokenize_leading_minus() {
		assert_eq!(tokenize("-A"), vec![(Sign::Minus, "A".to_string())]);
	}

	#[test]
	fn tokenize_skips_empty_names() {
		assert_eq!(
			tokenize("A+-B++C"),
			vec![
				(Sign::Plus, "A".to_string()),
				(Sign::Minus, "B".to_string()),
				(Sign::Plus, "C".to_string()),
			]
		);
		assert_eq!(tokenize(""), vec![]);
		assert_eq!(tokenize("+-+"), vec![]);
	}

	#[test]
	fn normalize_case_and_dollars() {
		assert_eq!(normalize("ka$$"), "KASS");
		assert_eq!(normalize("Best-Form"), "BEST-FORM");
	}

	#[test]
	fn period_shapes() {
		let (kind, generation) = match_period("BEST").unwrap();
		assert_eq!(kind, PeriodKind::Best);
		assert_eq!(generation.prefix, "");
		assert_eq!(generation.postfix, "");

		let (kind, generation) = match_period("GBEST14").unwrap();
		assert_eq!(kind, PeriodKind::Best);
		assert_eq!(generation.prefix, "G");
		assert_eq!(generation.postfix, "14");

		let (kind, _) = match_period("BESTFU").unwrap();
		assert_eq!(kind, PeriodKind::BestFu);

		let (kind, generation) = match_period("FU1314").unwrap();
		assert_eq!(kind, PeriodKind::Fu);
		assert_eq!(generation.postfix, "1314");

		assert!(match_period("FORM").is_none());
		assert!(match_period("BEST1").is_none());
		assert!(match_period("XBEST").is_none());
	}

	#[test]
	fn title_shapes() {
		let roots = vec!["FORM".to_string(), "KASS".to_string()];

		let (root, generation) = match_title("GFORM14", &roots).unwrap();
		assert_eq!(root, "FORM");
		assert_eq!(generation.prefix, "G");
		assert_eq!(generation.postfix, "14");

		// the root itself may start with a seniority letter
		let (root, generation) = match_title("KASS", &roots).unwrap();
		assert_eq!(root, "KASS");
		assert_eq!(generation.prefix, "");

		assert!(match_title("DIRECTUSER42", &roots).is_none());
		assert!(match_title("FORM", &[]).is_none());
	}

	#[test]
	fn direct_user_shapes() {
		assert_eq!(match_direct_user("DIRECTUSER42"), Some(42));
		assert_eq!(match_direct_user("DIRECTUSER"), None);
		assert_eq!(match_direct_user("DIRECTUSER4X"), None);
		assert_eq!(match_direct_user("USER42"), None);
	}

	#[test]
	fn period_postfixes() {
		assert_eq!(get_period("", "", 2013), Ok(2013));
		assert_eq!(get_period("", "13", 2013), Ok(2013));
		assert_eq!(get_period("", "57", 2013), Ok(1957));
		assert_eq!(get_period("", "56", 2013), Ok(2056));
		assert_eq!(get_period("", "1314", 2013), Ok(2013));
		assert_eq!(get_period("", "9900", 2013), Ok(1999));
		assert_eq!(get_period("", "2013", 2013), Ok(2013));
		assert_eq!(get_period("", "1992", 2013), Ok(1992));
		assert_eq!(get_period("", "1234", 2013), Err(InvalidPeriod));

		// a literal year that also reads as a consecutive pair is taken
		// as the pair
		assert_eq!(get_period("", "2021", 2013), Ok(2020));
	}

	#[test]
	fn period_prefixes() {
		assert_eq!(get_period("K", "13", 2013), Ok(2014));
		assert_eq!(get_period("G", "", 2013), Ok(2012));
		assert_eq!(get_period("B", "", 2013), Ok(2011));
		assert_eq!(get_period("O", "", 2013), Ok(2010));
		assert_eq!(get_period("T", "", 2013), Ok(2012));
		assert_eq!(get_period("G2", "", 2013), Ok(2011));
		assert_eq!(get_period("G3K", "", 2013), Ok(2011));
		assert_eq!(get_period("GG", "", 2013), Ok(2011));
	}
}
