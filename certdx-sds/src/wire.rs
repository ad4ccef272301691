//! Wire-level helpers shared by the server's response builder and the
//! client's request builder, so both sides agree on shape without
//! duplicating field-by-field construction.

use std::collections::HashMap;

use certdx_common::cert::Cert;
use chrono::SecondsFormat;

use crate::pb::{DataSource, DiscoveryRequest, DiscoveryResponse, Node, Secret, Status, TlsCertificate};
use crate::SDS_TYPE_URL;

/// Builds the first `DiscoveryRequest` a client sends on a fresh stream:
/// all configured resource names, with the name -> domain-set metadata
/// block the server needs to authorize and bind each subscription.
pub fn initial_request(resource_names: Vec<String>, domains_by_name: &HashMap<String, Vec<String>>) -> DiscoveryRequest {
    let metadata_domains = domains_by_name
        .iter()
        .map(|(name, domains)| (name.clone(), domains.join(",")))
        .collect();

    DiscoveryRequest {
        version_info: String::new(),
        node: Some(Node { id: "certdx-client".to_string(), metadata_domains }),
        resource_names,
        type_url: SDS_TYPE_URL.to_string(),
        response_nonce: String::new(),
        error_detail: None,
    }
}

/// Builds an ACK (or NACK, if `error` is set) for a previously received
/// response.
pub fn ack_request(resource_name: &str, version_info: &str, error: Option<String>) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: version_info.to_string(),
        node: None,
        resource_names: vec![resource_name.to_string()],
        type_url: SDS_TYPE_URL.to_string(),
        response_nonce: version_info.to_string(),
        error_detail: error.map(|message| Status { code: 3, message }),
    }
}

/// Builds the single-resource response the server pushes for a resource
/// subscription: `version_info` = `renewed_at` in RFC3339 (spec §4.7).
pub fn response_for_cert(resource_name: &str, cert: &Cert) -> DiscoveryResponse {
    let version_info = cert.renewed_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    DiscoveryResponse {
        version_info: version_info.clone(),
        resources: vec![Secret {
            name: resource_name.to_string(),
            tls_certificate: Some(TlsCertificate {
                certificate_chain: Some(DataSource { inline_bytes: cert.fullchain.clone() }),
                private_key: Some(DataSource { inline_bytes: cert.key.clone() }),
            }),
        }],
        type_url: SDS_TYPE_URL.to_string(),
        nonce: version_info,
    }
}

/// Parses `node.metadata_domains` into the per-resource domain sets the
/// first request must carry.
pub fn parse_domains_metadata(node: &Node) -> HashMap<String, Vec<String>> {
    node.metadata_domains
        .iter()
        .map(|(name, joined)| (name.clone(), joined.split(',').map(str::to_string).collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn response_version_info_is_rfc3339() {
        let cert = Cert::new(vec![1], vec![2], Utc::now(), Utc::now());
        let resp = response_for_cert("web", &cert);
        assert!(chrono::DateTime::parse_from_rfc3339(&resp.version_info).is_ok());
    }

    #[test]
    fn metadata_round_trips_domain_sets() {
        let mut by_name = HashMap::new();
        by_name.insert("web".to_string(), vec!["a.example.com".to_string(), "b.example.com".to_string()]);
        let req = initial_request(vec!["web".to_string()], &by_name);
        let parsed = parse_domains_metadata(req.node.as_ref().unwrap());
        assert_eq!(parsed.get("web").unwrap().len(), 2);
    }
}
