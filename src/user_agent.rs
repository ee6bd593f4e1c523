//! User-Agent string for protocol client traffic.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/corpus-mirror";

/// Default User-Agent for listing and fetch requests.
#[must_use]
pub(crate) fn default_mirror_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("corpus-mirror/{version} (bulk-mirror; +{PROJECT_UA_URL})")
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_contains_version_and_project_url() {
        let ua = default_mirror_user_agent();
        assert!(ua.contains(PROJECT_UA_URL), "UA must contain project URL: {ua}");
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            ua.strip_prefix("corpus-mirror/")
                .and_then(|s| s.split(' ').next())
                .expect("UA has version"),
        );
    }
}
