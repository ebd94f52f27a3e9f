//! List headers attached to each outbound recipient-group copy, so
//! subscribers' mail clients can tell list traffic from personal mail
//! and autoresponders keep quiet.

use crate::alias::AliasDescriptor;

/// The extra headers for one recipient group. `Precedence: bulk` and
/// autoresponder suppression only apply to proper groups; period and
/// direct-user aliases address specific people.
pub fn list_headers(
	sender: &str,
	domain: &str,
	descriptor: &AliasDescriptor,
) -> Vec<(String, String)> {
	let list_name = descriptor.list_name();
	let list_id = format!("{}.{}", list_name, domain);
	let unsubscribe = format!("<mailto:{}?subject=unsubscribe%20{}>", sender, list_name);
	let help = format!("<mailto:{}?subject=list-help>", sender);
	let subscribe = format!("<mailto:{}?subject=subscribe%20{}>", sender, list_name);

	let mut headers = vec![
		("Sender".to_string(), sender.to_string()),
		("List-Name".to_string(), list_name),
		("List-Id".to_string(), list_id),
		("List-Unsubscribe".to_string(), unsubscribe),
		("List-Help".to_string(), help),
		("List-Subscribe".to_string(), subscribe),
	];

	if descriptor.is_group() {
		headers.push(("Precedence".to_string(), "bulk".to_string()));
		headers.push(("X-Auto-Response-Suppress".to_string(), "OOF".to_string()));
	}

	headers
}
