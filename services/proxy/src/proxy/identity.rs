//! Peer identity extraction from a verified certificate chain.
//!
//! The routing key for a connection is the pair (CommonName, first
//! OrganizationalUnit) of the first certificate in the peer chain that
//! carries both. The chain is taken from a completed handshake, so it has
//! already been verified against the proxy-facing CA.

use std::fmt;

use thiserror::Error;
use x509_parser::der_parser::asn1_rs::Tag;
use x509_parser::prelude::*;

/// Routing identity of an inbound client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Subject CommonName.
    pub subject_id: String,
    /// First OrganizationalUnit of the subject.
    pub role: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.role)
    }
}

/// Identity extraction failures. All of them are terminal for the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The peer presented no certificates.
    #[error("peer presented no certificates")]
    EmptyChain,

    /// A certificate in the chain is not valid DER.
    #[error("peer certificate {index} could not be parsed: {reason}")]
    Unparseable { index: usize, reason: String },

    /// No certificate carries both a CommonName and an OrganizationalUnit.
    #[error("no CommonName/OrganizationalUnit pair in peer certificates")]
    NoQualifyingCertificate,
}

/// Extract the routing identity from a DER certificate chain.
pub fn extract_identity<C: AsRef<[u8]>>(chain: &[C]) -> Result<Identity, IdentityError> {
    if chain.is_empty() {
        return Err(IdentityError::EmptyChain);
    }

    for (index, der) in chain.iter().enumerate() {
        let (_, cert) =
            X509Certificate::from_der(der.as_ref()).map_err(|e| IdentityError::Unparseable {
                index,
                reason: e.to_string(),
            })?;

        let subject = cert.subject();
        let common_name = subject
            .iter_common_name()
            .find_map(attribute_text)
            .filter(|cn| !cn.is_empty());
        let unit = subject
            .iter_organizational_unit()
            .next()
            .and_then(attribute_text)
            .filter(|ou| !ou.is_empty());

        if let (Some(subject_id), Some(role)) = (common_name, unit) {
            return Ok(Identity { subject_id, role });
        }
    }

    Err(IdentityError::NoQualifyingCertificate)
}

/// Text of a directory string attribute.
///
/// The single-byte string types are handled by x509-parser; BMPString
/// (UCS-2, big endian) and UniversalString (UCS-4, big endian) are decoded
/// here. Malformed values count as absent.
fn attribute_text(attr: &AttributeTypeAndValue<'_>) -> Option<String> {
    if let Ok(text) = attr.as_str() {
        return Some(text.to_string());
    }

    let value = attr.attr_value();
    let data = value.data;
    match value.header.tag() {
        Tag::BmpString => {
            if data.len() % 2 != 0 {
                return None;
            }
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16(&units).ok()
        }
        Tag::UniversalString => {
            if data.len() % 4 != 0 {
                return None;
            }
            data.chunks_exact(4)
                .map(|c| char::from_u32(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
                .collect()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

    fn cert(cn: Option<&str>, units: &[&str]) -> Vec<u8> {
        let params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        if let Some(cn) = cn {
            dn.push(DnType::CommonName, cn);
        }
        for unit in units {
            dn.push(DnType::OrganizationalUnitName, *unit);
        }
        dn.push(DnType::OrganizationName, "dockgate");
        signed(params, dn)
    }

    fn signed(mut params: CertificateParams, dn: DistinguishedName) -> Vec<u8> {
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn test_single_certificate() {
        let chain = vec![cert(Some("alice"), &["dev"])];
        let identity = extract_identity(&chain).unwrap();
        assert_eq!(identity.subject_id, "alice");
        assert_eq!(identity.role, "dev");
        assert_eq!(identity.to_string(), "alice/dev");
    }

    #[test]
    fn test_wide_string_attributes() {
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::BmpString("élodie".try_into().unwrap()),
        );
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::UniversalString("dev".try_into().unwrap()),
        );
        let chain = vec![signed(CertificateParams::default(), dn)];

        let identity = extract_identity(&chain).unwrap();
        assert_eq!(identity.subject_id, "élodie");
        assert_eq!(identity.role, "dev");
    }

    #[test]
    fn test_first_ou_wins() {
        let chain = vec![cert(Some("bob"), &["ops", "dev"])];
        assert_eq!(extract_identity(&chain).unwrap().role, "ops");
    }

    #[test]
    fn test_first_qualifying_certificate_in_chain_order() {
        let chain = vec![
            cert(Some("leaf-without-ou"), &[]),
            cert(None, &["orphan-unit"]),
            cert(Some("carol"), &["admin"]),
            cert(Some("dave"), &["dev"]),
        ];
        let identity = extract_identity(&chain).unwrap();
        assert_eq!(identity.subject_id, "carol");
        assert_eq!(identity.role, "admin");
    }

    #[test]
    fn test_no_qualifying_certificate() {
        let chain = vec![cert(Some("alice"), &[]), cert(None, &["dev"])];
        assert_eq!(
            extract_identity(&chain),
            Err(IdentityError::NoQualifyingCertificate)
        );
    }

    #[test]
    fn test_empty_chain() {
        let chain: Vec<Vec<u8>> = Vec::new();
        assert_eq!(extract_identity(&chain), Err(IdentityError::EmptyChain));
    }

    #[test]
    fn test_garbage_certificate() {
        let chain = vec![b"not a certificate".to_vec()];
        assert!(matches!(
            extract_identity(&chain),
            Err(IdentityError::Unparseable { index: 0, .. })
        ));
    }
}
