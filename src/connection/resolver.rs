//! Endpoint contract resolution.
//!
//! Sending to Spine needs the recipient's transmission details: party key,
//! CPA id, endpoint URL and the reliable-messaging contract properties. On a
//! live deployment these come from the SDS directory; that lookup lives
//! behind [`EndpointResolver`] so the messaging core does not care where the
//! details come from.

use std::sync::RwLock;

use anyhow::anyhow;
use rustc_hash::FxHashMap;

/// Everything needed to transmit one interaction type to one recipient.
///
/// The string-typed fields (`sync_reply`, `duplicate_elimination`,
/// `ack_requested`) carry the directory's values verbatim, since their
/// vocabularies ("always", "never", "MSHSignalsOnly", "none") belong to the
/// directory schema rather than to this crate.
#[derive(Debug, Clone)]
pub struct TransmissionDetails {
    pub org_code: String,
    pub party_key: String,
    pub cpa_id: String,
    pub service: String,
    pub interaction_id: String,
    /// Service-qualified interaction id, "service:interaction".
    pub svc_ia: String,
    pub soap_actor: String,
    pub asids: Vec<String>,
    pub url: String,
    pub sync_reply: String,
    pub duplicate_elimination: String,
    pub ack_requested: String,
    /// Total transmission attempts allowed. Zero means unreliable.
    pub retries: u32,
    pub retry_interval: i64,
    pub persist_duration: i64,
}

impl TransmissionDetails {
    /// Whether this interaction is answered on the request connection.
    /// Anything with duplicate elimination is asynchronous regardless of its
    /// syncreply mode.
    pub fn is_synchronous(&self) -> bool {
        if self.duplicate_elimination.eq_ignore_ascii_case("always") {
            return false;
        }
        let s = self.sync_reply.trim();
        s.is_empty() || s.eq_ignore_ascii_case("none")
    }
}

/// Source of transmission details and URL overrides.
///
/// `resolve_url` works around the directory design flaw where the registered
/// endpoint URL is not always the URL a sender must actually use: when an
/// override is configured for a service/interaction it wins over the URL in
/// the transmission details.
pub trait EndpointResolver: Send + Sync + 'static {
    /// Matching transmission details for the given service-qualified
    /// interaction and owning organisation, optionally filtered by ASID and
    /// party key. Empty when nothing matches.
    fn resolve(
        &self,
        svc_ia: &str,
        org_code: &str,
        asid: Option<&str>,
        party_key: Option<&str>,
    ) -> Vec<TransmissionDetails>;

    /// URL override for the given service-qualified interaction, or `None`
    /// if the URL from the transmission details should be used.
    fn resolve_url(&self, svc_ia: &str) -> Option<String>;
}

/// In-memory resolver, populated by the embedding application from whatever
/// directory source it has.
pub struct StaticEndpointResolver {
    details: RwLock<FxHashMap<String, Vec<TransmissionDetails>>>,
    url_overrides: RwLock<FxHashMap<String, String>>,
}

impl Default for StaticEndpointResolver {
    fn default() -> Self {
        StaticEndpointResolver {
            details: RwLock::new(FxHashMap::default()),
            url_overrides: RwLock::new(FxHashMap::default()),
        }
    }
}

impl StaticEndpointResolver {
    pub fn new() -> StaticEndpointResolver {
        Self::default()
    }

    pub fn add(&self, details: TransmissionDetails) {
        let mut map = match self.details.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        map.entry(details.svc_ia.clone()).or_default().push(details);
    }

    pub fn add_url_override(&self, svc_ia: String, url: String) {
        let mut map = match self.url_overrides.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        map.insert(svc_ia, url);
    }
}

impl EndpointResolver for StaticEndpointResolver {
    fn resolve(
        &self,
        svc_ia: &str,
        org_code: &str,
        asid: Option<&str>,
        party_key: Option<&str>,
    ) -> Vec<TransmissionDetails> {
        let map = match self.details.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let Some(all) = map.get(svc_ia) else {
            return Vec::new();
        };
        all.iter()
            .filter(|d| d.org_code == org_code)
            .filter(|d| asid.map(|a| d.asids.iter().any(|x| x == a)).unwrap_or(true))
            .filter(|d| party_key.map(|p| d.party_key == p).unwrap_or(true))
            .cloned()
            .collect()
    }

    fn resolve_url(&self, svc_ia: &str) -> Option<String> {
        let map = match self.url_overrides.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        map.get(svc_ia).cloned()
    }
}

/// Convert an ISO 8601 duration (e.g. "PT4M") to seconds. The directory
/// presents retryInterval and persistDuration in this format. Only the
/// time-of-day units occur there, so days and larger are not handled.
pub fn iso8601_duration_to_seconds(duration: &str) -> i64 {
    let mut seconds: i64 = 0;
    let mut multiplier: i64 = 1;
    for c in duration.chars().rev() {
        if c.is_ascii_alphabetic() {
            match c {
                'S' => multiplier = 1,
                'M' => multiplier = 60,
                'H' => multiplier = 3600,
                'T' => return seconds,
                _ => {}
            }
        } else if let Some(d) = c.to_digit(10) {
            seconds += d as i64 * multiplier;
            multiplier *= 10;
        }
    }
    seconds
}

/// Built-in persist durations for common Spine interactions, used when no
/// override file is configured. Tab separated, svc_ia then ISO 8601
/// duration, "#" comments.
pub const DEFAULT_PERSIST_DURATIONS: &str = "\
# persistDuration by service-qualified interaction id
urn:nhs:names:services:itk:COPC_IN000001GB01\tPT9M
urn:nhs:names:services:pdsquery:QUPA_IN000006UK02\tPT1H
urn:nhs:names:services:pdsquery:QUPA_IN000011UK02\tPT1H
urn:nhs:names:services:pds:PRPA_IN000203UK03\tPT1H
urn:nhs:names:services:ebs:PRSC_IN080000UK07\tPT9M
urn:nhs:names:services:ebs:PRSC_IN070000UK08\tPT9M
urn:nhs:names:services:psis:REPC_IN150015UK05\tPT1H
urn:nhs:names:services:psisquery:QUPC_IN160101UK05\tPT1H
urn:nhs:names:services:lrs:REPC_IN110001UK07\tPT9M
urn:nhs:names:services:mm:PORX_IN070101UK31\tPT1H
urn:nhs:names:services:mm:PORX_IN080101UK31\tPT1H
";

/// Parse a persist durations table in the tab-separated format.
pub fn parse_persist_durations(content: &str) -> anyhow::Result<FxHashMap<String, i64>> {
    let mut durations = FxHashMap::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((svc_ia, duration)) = line.split_once('\t') else {
            return Err(anyhow!("malformed persist duration line: {}", line));
        };
        durations.insert(
            svc_ia.trim().to_string(),
            iso8601_duration_to_seconds(duration.trim()),
        );
    }
    Ok(durations)
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn details(org: &str, party_key: &str, asid: &str) -> TransmissionDetails {
        TransmissionDetails {
            org_code: org.to_string(),
            party_key: party_key.to_string(),
            cpa_id: "cpa".to_string(),
            service: "urn:nhs:names:services:pdsquery".to_string(),
            interaction_id: "QUPA_IN000006UK02".to_string(),
            svc_ia: "urn:nhs:names:services:pdsquery:QUPA_IN000006UK02".to_string(),
            soap_actor: String::new(),
            asids: vec![asid.to_string()],
            url: "https://spine.example/x".to_string(),
            sync_reply: "MSHSignalsOnly".to_string(),
            duplicate_elimination: "always".to_string(),
            ack_requested: "always".to_string(),
            retries: 3,
            retry_interval: 60,
            persist_duration: 3600,
        }
    }

    #[rstest]
    #[case("PT4M", 240)]
    #[case("PT1H", 3600)]
    #[case("PT1H30M", 5400)]
    #[case("PT30S", 30)]
    #[case("PT0S", 0)]
    fn test_iso8601_duration(#[case] duration: &str, #[case] expected: i64) {
        assert_eq!(iso8601_duration_to_seconds(duration), expected);
    }

    #[rstest]
    #[case("never", "none", true)]
    #[case("never", "", true)]
    #[case("never", "MSHSignalsOnly", false)]
    #[case("always", "none", false)]
    #[case("always", "MSHSignalsOnly", false)]
    fn test_is_synchronous(
        #[case] dup_elim: &str,
        #[case] sync_reply: &str,
        #[case] expected: bool,
    ) {
        let mut d = details("X09", "X09-1", "1");
        d.duplicate_elimination = dup_elim.to_string();
        d.sync_reply = sync_reply.to_string();
        assert_eq!(d.is_synchronous(), expected);
    }

    #[test]
    fn test_static_resolver_filters() {
        let r = StaticEndpointResolver::new();
        r.add(details("X09", "X09-1", "111"));
        r.add(details("X09", "X09-2", "222"));
        r.add(details("X26", "X26-1", "333"));
        let svc_ia = "urn:nhs:names:services:pdsquery:QUPA_IN000006UK02";

        assert_eq!(r.resolve(svc_ia, "X09", None, None).len(), 2);
        assert_eq!(r.resolve(svc_ia, "X09", Some("222"), None).len(), 1);
        assert_eq!(r.resolve(svc_ia, "X09", None, Some("X09-1")).len(), 1);
        assert!(r.resolve(svc_ia, "Z99", None, None).is_empty());
        assert!(r.resolve("urn:other", "X09", None, None).is_empty());
    }

    #[test]
    fn test_url_override() {
        let r = StaticEndpointResolver::new();
        assert_eq!(r.resolve_url("x"), None);
        r.add_url_override("x".to_string(), "https://override.example/y".to_string());
        assert_eq!(r.resolve_url("x").unwrap(), "https://override.example/y");
    }

    #[test]
    fn test_parse_persist_durations() {
        let parsed = parse_persist_durations(DEFAULT_PERSIST_DURATIONS).unwrap();
        assert_eq!(
            parsed["urn:nhs:names:services:pdsquery:QUPA_IN000006UK02"],
            3600
        );
        assert_eq!(parsed["urn:nhs:names:services:itk:COPC_IN000001GB01"], 540);
        assert!(parse_persist_durations("not tab separated").is_err());
    }
}
