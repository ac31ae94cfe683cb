//! SPKI certificate pinning.
//!
//! A pin is the SHA-256 of the server leaf certificate's
//! SubjectPublicKeyInfo, lowercase hex. The SPKI element is located with a
//! minimal DER walk over the X.509 structure: the TBS certificate's fields
//! up to the SPKI have fixed order (optional version, serial, signature
//! algorithm, issuer, validity, subject), so six skips land on it.

use sha2::{Digest, Sha256};

/// Result of checking a presented certificate against a pin set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinCheck {
    /// A pin matched the presented SPKI.
    Matched,
    /// No pin matched; carries the SPKI digest actually presented.
    Mismatched {
        /// Lowercase hex SHA-256 of the presented SPKI.
        presented: String,
    },
    /// The certificate could not be parsed far enough to find the SPKI.
    Unparseable,
}

/// Compare a leaf certificate (DER) against configured pins.
pub fn check_pins(cert_der: &[u8], pins: &[String]) -> PinCheck {
    let Some(spki) = extract_spki(cert_der) else {
        return PinCheck::Unparseable;
    };
    let digest = hex::encode(Sha256::digest(spki));
    if pins.iter().any(|pin| pin.eq_ignore_ascii_case(&digest)) {
        PinCheck::Matched
    } else {
        PinCheck::Mismatched { presented: digest }
    }
}

/// SHA-256 of the SPKI element, lowercase hex; `None` when the DER cannot
/// be navigated.
pub fn spki_sha256_hex(cert_der: &[u8]) -> Option<String> {
    extract_spki(cert_der).map(|spki| hex::encode(Sha256::digest(spki)))
}

/// Locate the SubjectPublicKeyInfo TLV inside a DER certificate and return
/// it whole (tag and length included), as pin digests are computed over the
/// full element.
pub fn extract_spki(cert_der: &[u8]) -> Option<&[u8]> {
    // Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signature }
    let (tag, content) = read_element(cert_der)?;
    if tag != 0x30 {
        return None;
    }

    // tbsCertificate ::= SEQUENCE { ... }
    let (tag, mut tbs) = read_element(content)?;
    if tag != 0x30 {
        return None;
    }

    // Optional explicit version: context tag [0].
    if tbs.first() == Some(&0xa0) {
        tbs = skip_element(tbs)?;
    }
    // serialNumber INTEGER
    tbs = skip_element(tbs)?;
    // signature AlgorithmIdentifier
    tbs = skip_element(tbs)?;
    // issuer Name
    tbs = skip_element(tbs)?;
    // validity
    tbs = skip_element(tbs)?;
    // subject Name
    tbs = skip_element(tbs)?;

    // subjectPublicKeyInfo SEQUENCE: return the whole TLV.
    let (tag, _) = read_element(tbs)?;
    if tag != 0x30 {
        return None;
    }
    let total = element_len(tbs)?;
    tbs.get(..total)
}

/// Read one DER element: returns its tag and content slice.
fn read_element(input: &[u8]) -> Option<(u8, &[u8])> {
    let tag = *input.first()?;
    let (header, len) = read_length(input)?;
    input.get(header..header + len).map(|content| (tag, content))
}

/// Total length of the first element (header + content).
fn element_len(input: &[u8]) -> Option<usize> {
    let (header, len) = read_length(input)?;
    Some(header + len)
}

/// The remainder after the first element.
fn skip_element(input: &[u8]) -> Option<&[u8]> {
    let total = element_len(input)?;
    input.get(total..)
}

/// Parse the DER length octets at `input[1..]`; returns (header bytes,
/// content length).
fn read_length(input: &[u8]) -> Option<(usize, usize)> {
    let first = *input.get(1)?;
    if first < 0x80 {
        return Some((2, first as usize));
    }
    let count = (first & 0x7f) as usize;
    if count == 0 || count > 4 {
        return None;
    }
    let mut len: usize = 0;
    for i in 0..count {
        len = (len << 8) | *input.get(2 + i)? as usize;
    }
    Some((2 + count, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a DER element with short-form length.
    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        assert!(content.len() < 0x80);
        let mut out = vec![tag, content.len() as u8];
        out.extend_from_slice(content);
        out
    }

    /// A structurally minimal certificate: enough fields, garbage content.
    fn fake_cert(spki_content: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let serial = tlv(0x02, &[0x01]);
        let sig_alg = tlv(0x30, &[]);
        let issuer = tlv(0x30, &[]);
        let validity = tlv(0x30, &[]);
        let subject = tlv(0x30, &[]);
        let spki = tlv(0x30, spki_content);

        let mut tbs_content = Vec::new();
        tbs_content.extend_from_slice(&tlv(0xa0, &tlv(0x02, &[0x02])));
        tbs_content.extend_from_slice(&serial);
        tbs_content.extend_from_slice(&sig_alg);
        tbs_content.extend_from_slice(&issuer);
        tbs_content.extend_from_slice(&validity);
        tbs_content.extend_from_slice(&subject);
        tbs_content.extend_from_slice(&spki);
        let tbs = tlv(0x30, &tbs_content);

        let mut cert_content = Vec::new();
        cert_content.extend_from_slice(&tbs);
        cert_content.extend_from_slice(&tlv(0x30, &[]));
        cert_content.extend_from_slice(&tlv(0x03, &[0x00]));
        (tlv(0x30, &cert_content), spki)
    }

    #[test]
    fn spki_is_located() {
        let (cert, spki) = fake_cert(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(extract_spki(&cert), Some(spki.as_slice()));
    }

    #[test]
    fn matching_pin_passes() {
        let (cert, spki) = fake_cert(&[0x01, 0x02, 0x03]);
        let pin = hex::encode(Sha256::digest(&spki));
        assert_eq!(check_pins(&cert, &[pin.to_uppercase()]), PinCheck::Matched);
    }

    #[test]
    fn wrong_pin_reports_presented_digest() {
        let (cert, spki) = fake_cert(&[0x01, 0x02, 0x03]);
        let expected = hex::encode(Sha256::digest(&spki));
        match check_pins(&cert, &["00".repeat(32)]) {
            PinCheck::Mismatched { presented } => assert_eq!(presented, expected),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn garbage_is_unparseable() {
        assert_eq!(check_pins(&[0xff, 0x00], &["aa".repeat(32)]), PinCheck::Unparseable);
        assert_eq!(extract_spki(&[]), None);
    }
}
