use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Header carrying a forced fingerprint on local transports.
pub const FINGERPRINT_HEADER: &str = "x-fingerprint";

/// Observed (or forced) egress identity of a proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub useragent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn_network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl Fingerprint {
    /// Synthetic identity used by local providers, named after a region.
    pub fn synthetic(region: &str) -> Self {
        Self {
            ip: "1.1.1.1".to_string(),
            useragent: None,
            asn_name: Some("Dummy ASN".to_string()),
            asn_network: Some("1.1.1.0/24".to_string()),
            continent_code: Some("XX".to_string()),
            continent_name: Some(region.to_string()),
            country_code: Some("fr".to_string()),
            country_name: Some("France".to_string()),
            city_name: Some("Paris".to_string()),
            timezone: Some("Europe/Paris".to_string()),
            latitude: Some(48.8566),
            longitude: Some(2.3522),
        }
    }

    /// Encode as the value of the forced fingerprint header.
    pub fn to_header_value(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn from_header_value(value: &str) -> Result<Self> {
        let raw = BASE64
            .decode(value.trim())
            .map_err(|e| PoolError::Fingerprint(format!("invalid fingerprint header: {}", e)))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value_decodes_to_same_identity() {
        let fingerprint = Fingerprint::synthetic("eu-west-1");
        let header = fingerprint.to_header_value().unwrap();
        let decoded = Fingerprint::from_header_value(&header).unwrap();

        assert_eq!(decoded, fingerprint);
        assert_eq!(decoded.continent_name.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn test_parses_minimal_probe_response() {
        let fingerprint: Fingerprint =
            serde_json::from_str(r#"{"ip":"5.6.7.8","countryCode":"de","asnName":"Hetzner"}"#)
                .unwrap();

        assert_eq!(fingerprint.ip, "5.6.7.8");
        assert_eq!(fingerprint.country_code.as_deref(), Some("de"));
        assert_eq!(fingerprint.asn_name.as_deref(), Some("Hetzner"));
        assert!(fingerprint.city_name.is_none());
    }

    #[test]
    fn test_rejects_garbage_header() {
        assert!(Fingerprint::from_header_value("%%%").is_err());
    }
}
