//! XMPP server resolution via SRV records (RFC 6120 §3.2, XEP-0368).
//!
//! Turns a bare XMPP domain into candidate [`ConnectionParameters`] in
//! connection-attempt order. The engine never resolves on its own; the owning
//! layer picks a candidate and builds the engine with it.

use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::{ConnectionParameters, DEFAULT_PLAIN_PORT};
use crate::error::Result;

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// One SRV answer, reduced to what ordering needs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SrvRecord {
    priority: u16,
    weight: u16,
    target: String,
    port: u16,
}

/// Orders records by priority ascending, then weight descending (RFC 2782),
/// and turns them into candidates. A `.` target means the service is
/// explicitly unavailable and is skipped.
fn candidates_from_records(
    mut records: Vec<SrvRecord>,
    use_tls: bool,
    domain: &str,
) -> Vec<ConnectionParameters> {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.weight.cmp(&a.weight))
    });

    records
        .into_iter()
        .filter_map(|record| {
            let target = record.target.trim_end_matches('.');
            if target.is_empty() {
                info!(domain, "SRV record with '.' target (service not available), skipping");
                return None;
            }
            info!(
                domain, host = %target, port = record.port,
                priority = record.priority, weight = record.weight, use_tls,
                "SRV record"
            );
            Some(ConnectionParameters::new(target, record.port, use_tls).with_domain(domain))
        })
        .collect()
}

/// Without SRV records the domain itself is the host, on the standard
/// client port, without TLS.
fn fallback(domain: &str) -> ConnectionParameters {
    ConnectionParameters::new(domain, DEFAULT_PLAIN_PORT, false)
}

async fn lookup(resolver: &TokioAsyncResolver, srv_name: &str, domain: &str) -> Vec<SrvRecord> {
    let started = Instant::now();
    match resolver.srv_lookup(srv_name).await {
        Ok(answer) => {
            let records: Vec<SrvRecord> = answer
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    target: srv.target().to_string(),
                    port: srv.port(),
                })
                .collect();
            info!(
                domain, srv = %srv_name, count = records.len(),
                lookup_ms = elapsed_ms(started),
                "SRV lookup complete"
            );
            records
        }
        Err(e) => {
            info!(
                domain, srv = %srv_name,
                lookup_ms = elapsed_ms(started),
                error = %e,
                "SRV lookup failed"
            );
            Vec::new()
        }
    }
}

/// Resolve an XMPP domain into connection candidates.
///
/// Order:
/// 1. `_xmpps-client._tcp.{domain}` records (direct TLS)
/// 2. `_xmpp-client._tcp.{domain}` records (plain)
/// 3. `domain:5222` plain, only if no usable SRV record exists at all
///
/// SRV-derived candidates carry `domain` so TLS names the XMPP domain rather
/// than the SRV target.
pub async fn resolve_xmpp_server(domain: &str) -> Result<Vec<ConnectionParameters>> {
    let started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, falling back to default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let tls_records = lookup(&resolver, &format!("_xmpps-client._tcp.{}", domain), domain).await;
    let plain_records = lookup(&resolver, &format!("_xmpp-client._tcp.{}", domain), domain).await;

    let mut candidates = candidates_from_records(tls_records, true, domain);
    candidates.extend(candidates_from_records(plain_records, false, domain));

    if candidates.is_empty() {
        warn!(
            domain,
            resolve_total_ms = elapsed_ms(started),
            "No SRV records found, using fallback: {}:{}",
            domain,
            DEFAULT_PLAIN_PORT
        );
        candidates.push(fallback(domain));
    } else {
        info!(
            domain,
            total = candidates.len(),
            resolve_total_ms = elapsed_ms(started),
            "SRV resolution complete"
        );
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(priority: u16, weight: u16, target: &str, port: u16) -> SrvRecord {
        SrvRecord {
            priority,
            weight,
            target: target.to_string(),
            port,
        }
    }

    #[test]
    fn test_records_sorted_by_priority_then_weight() {
        let records = vec![
            record(20, 0, "backup.example.com.", 5223),
            record(10, 5, "light.example.com.", 5223),
            record(10, 50, "heavy.example.com.", 5223),
        ];
        let hosts: Vec<String> = candidates_from_records(records, true, "example.com")
            .into_iter()
            .map(|c| c.hostname)
            .collect();
        assert_eq!(
            hosts,
            vec!["heavy.example.com", "light.example.com", "backup.example.com"]
        );
    }

    #[test]
    fn test_candidates_carry_domain_for_tls_name() {
        let candidates = candidates_from_records(
            vec![record(0, 0, "v4.mdosch.de.", 5223)],
            true,
            "diebesban.de",
        );
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].use_tls);
        assert_eq!(candidates[0].hostname, "v4.mdosch.de");
        assert_eq!(candidates[0].tls_name(), "diebesban.de");
    }

    #[test]
    fn test_dot_target_is_skipped() {
        let candidates = candidates_from_records(
            vec![record(0, 0, ".", 0), record(5, 0, "xmpp.example.com.", 5222)],
            false,
            "example.com",
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].hostname, "xmpp.example.com");
        assert!(!candidates[0].use_tls);
    }

    #[test]
    fn test_fallback_is_plain_on_domain() {
        let candidate = fallback("example.com");
        assert_eq!(candidate, ConnectionParameters::new("example.com", 5222, false));
        assert_eq!(candidate.domain, None);
    }

    #[tokio::test]
    async fn test_resolve_nonexistent_domain_returns_fallback() {
        let candidates =
            resolve_xmpp_server("this-domain-definitely-does-not-exist-xmpp-test.example")
                .await
                .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].hostname,
            "this-domain-definitely-does-not-exist-xmpp-test.example"
        );
        assert_eq!(candidates[0].port, 5222);
        assert!(!candidates[0].use_tls);
        assert_eq!(candidates[0].domain, None);
    }
}
