use hickory_resolver::TokioAsyncResolver;

/// A policy of `reject` or `quarantine` means the domain owner wants
/// unsigned mail dropped, and a resent copy of it would be.
pub fn policy_is_strict(record: &str) -> bool {
	record
		.split(';')
		.any(|part| matches!(part.trim(), "p=reject" | "p=quarantine"))
}

/// Whether `domain` publishes a strict DMARC policy. Lookup problems
/// count as not strict; we only ever use this to reject mail.
pub async fn domain_is_strict(resolver: &TokioAsyncResolver, domain: &str) -> bool {
	let name = format!("_dmarc.{}.", domain);

	match resolver.txt_lookup(name).await {
		Ok(lookup) => lookup
			.iter()
			.any(|record| policy_is_strict(&record.to_string())),
		Err(error) => {
			tracing::debug!("no DMARC policy for {}: {}", domain, error);
			false
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn policies() {
		assert!(policy_is_strict("v=DMARC1; p=reject"));
		assert!(policy_is_strict("v=DMARC1;p=quarantine;pct=100"));
		assert!(policy_is_strict("v=DMARC1; p=reject; rua=mailto:x@example.com"));

		assert!(!policy_is_strict("v=DMARC1; p=none"));
		assert!(!policy_is_strict("v=DMARC1; sp=reject"));
		assert!(!policy_is_strict(""));
	}
}
