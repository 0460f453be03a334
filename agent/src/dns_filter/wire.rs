//! Just enough of the DNS wire format for the filter: pull the first QNAME
//! out of a query, synthesize an NXDOMAIN, build a bare query for tests.
//!
//! Queries reaching the filter come from the local stub resolver, which does
//! not compress question names. A compression pointer is therefore refused
//! outright instead of followed, which also rules out pointer loops.

use thiserror::Error;

pub const HEADER_LEN: usize = 12;

/// Presentation-format limit; labels already cap at 63 by encoding.
const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("datagram shorter than a DNS header")]
    TooShort,
    #[error("message is a response, not a query")]
    NotAQuery,
    #[error("query carries no question")]
    NoQuestion,
    #[error("name runs past the end of the datagram")]
    Truncated,
    #[error("name uses compression pointers")]
    Compressed,
    #[error("name uses a reserved label type")]
    UnsupportedLabel,
    #[error("name exceeds {MAX_NAME_LEN} octets")]
    NameTooLong,
}

/// Extracts the first question's name, lower-cased, in dotted form.
pub fn qname(datagram: &[u8]) -> Result<String, Error> {
    if datagram.len() < HEADER_LEN {
        return Err(Error::TooShort);
    }
    if datagram[2] & 0x80 != 0 {
        return Err(Error::NotAQuery);
    }
    let qdcount = u16::from_be_bytes([datagram[4], datagram[5]]);
    if qdcount == 0 {
        return Err(Error::NoQuestion);
    }

    let mut name = String::new();
    let mut offset = HEADER_LEN;
    loop {
        let &len = datagram.get(offset).ok_or(Error::Truncated)?;
        match len {
            0 => break,
            len if len & 0xC0 == 0xC0 => return Err(Error::Compressed),
            len if len & 0xC0 != 0 => return Err(Error::UnsupportedLabel),
            len => {
                let len = usize::from(len);
                let label = datagram
                    .get(offset + 1..offset + 1 + len)
                    .ok_or(Error::Truncated)?;
                if !name.is_empty() {
                    name.push('.');
                }
                for &byte in label {
                    name.push(byte.to_ascii_lowercase() as char);
                }
                if name.len() > MAX_NAME_LEN {
                    return Err(Error::NameTooLong);
                }
                offset += 1 + len;
            }
        }
    }

    Ok(name)
}

/// A name is allowed iff it equals an allow entry or is a subdomain of one.
/// Case-insensitive.
pub fn is_allowed<S: AsRef<str>>(name: &str, allow: &[S]) -> bool {
    let name = name.to_ascii_lowercase();

    allow.iter().any(|allowed| {
        let allowed = allowed.as_ref().to_ascii_lowercase();
        name == allowed || name.ends_with(&format!(".{allowed}"))
    })
}

/// Synthesizes the negative answer: the query body verbatim, with QR and RA
/// raised and RCODE set to name-error.
pub fn nxdomain(query: &[u8]) -> Vec<u8> {
    let mut response = query.to_vec();
    if response.len() >= HEADER_LEN {
        response[2] = 0x81;
        response[3] = 0x83;
    }

    response
}

/// Builds a plain A-record query. The filter never sends these itself; they
/// feed the tests and the debug tooling.
pub fn query(id: u16, name: &str) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    datagram.extend_from_slice(&id.to_be_bytes());
    datagram.extend_from_slice(&[0x01, 0x00]); // RD
    datagram.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in name.split('.').filter(|label| !label.is_empty()) {
        datagram.push(label.len() as u8);
        datagram.extend_from_slice(label.as_bytes());
    }
    datagram.push(0);
    datagram.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // QTYPE A, QCLASS IN

    datagram
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn qname_roundtrip_lowercases() {
        let datagram = query(7, "www.CodeForces.com");

        assert_eq!(qname(&datagram).unwrap(), "www.codeforces.com");
    }

    #[test]
    fn qname_of_root_is_empty() {
        assert_eq!(qname(&query(7, "")).unwrap(), "");
    }

    #[test]
    fn rejects_short_datagrams() {
        assert_eq!(qname(&[0u8; 4]), Err(Error::TooShort));
    }

    #[test]
    fn rejects_responses() {
        let mut datagram = query(7, "codeforces.com");
        datagram[2] |= 0x80;

        assert_eq!(qname(&datagram), Err(Error::NotAQuery));
    }

    #[test]
    fn rejects_zero_questions() {
        let mut datagram = query(7, "codeforces.com");
        datagram[5] = 0;

        assert_eq!(qname(&datagram), Err(Error::NoQuestion));
    }

    #[test]
    fn rejects_truncated_names() {
        let mut datagram = query(7, "codeforces.com");
        datagram.truncate(HEADER_LEN + 5);

        assert_eq!(qname(&datagram), Err(Error::Truncated));
    }

    #[test]
    fn refuses_compression_pointers() {
        let mut datagram = query(7, "");
        // Replace the root label with a pointer back into the header.
        datagram[HEADER_LEN] = 0xC0;
        datagram.insert(HEADER_LEN + 1, 0x04);

        assert_eq!(qname(&datagram), Err(Error::Compressed));
    }

    #[test]
    fn refuses_reserved_label_types() {
        let mut datagram = query(7, "");
        datagram[HEADER_LEN] = 0x40;

        assert_eq!(qname(&datagram), Err(Error::UnsupportedLabel));
    }

    #[test]
    fn rejects_oversized_names() {
        let name = vec!["a".repeat(60); 5].join(".");

        assert_eq!(qname(&query(7, &name)), Err(Error::NameTooLong));
    }

    #[test_case("codeforces.com" => true; "exact match")]
    #[test_case("CODEFORCES.COM" => true; "exact match is case-insensitive")]
    #[test_case("www.codeforces.com" => true; "subdomain")]
    #[test_case("WWW.CodeForces.Com" => true; "subdomain is case-insensitive")]
    #[test_case("deep.www.codeforces.com" => true; "nested subdomain")]
    #[test_case("evilcodeforces.com" => false; "suffix without a dot")]
    #[test_case("codeforces.com.evil.example" => false; "allow entry in the middle")]
    #[test_case("example.com" => false; "unrelated")]
    #[test_case("" => false; "root")]
    fn matching(name: &str) -> bool {
        is_allowed(name, &["codeforces.com", "msftconnecttest.com"])
    }

    #[test]
    fn nxdomain_mirrors_the_question() {
        let datagram = query(0xBEEF, "evil.example.com");

        let response = nxdomain(&datagram);

        assert_eq!(response[0..2], 0xBEEFu16.to_be_bytes());
        assert_eq!(response[2], 0x81); // QR=1, RD preserved
        assert_eq!(response[3], 0x83); // RA=1, RCODE=3
        assert_eq!(response[4..], datagram[4..]); // counts + question untouched
    }
}
