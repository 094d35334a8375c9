use base64::{prelude::BASE64_STANDARD, Engine};
use rand::distributions::{Alphanumeric, DistString};
use time::{Duration, OffsetDateTime};

pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// SAML identifiers must be NCNames, so they cannot start with a digit.
pub fn new_request_id() -> String {
    format!("_id{}", random_string(32))
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

/// Decodes a PEM certificate into DER. Input without PEM armor is returned as-is.
pub fn pem_to_der(input: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    let Ok(text) = std::str::from_utf8(input) else {
        return Ok(input.to_vec());
    };
    if !text.contains("-----BEGIN") {
        return Ok(input.to_vec());
    }
    let body: String = text
        .lines()
        .filter(|line| !line.starts_with("-----BEGIN") && !line.starts_with("-----END"))
        .collect();
    decode_xml_base64(&body)
}

/// `xs:duration` rendering used for `cacheDuration`.
pub fn xs_duration(duration: Duration) -> String {
    format!("PT{}S", duration.whole_seconds())
}

/// Parses the `xs:duration` values found in metadata `cacheDuration`.
/// Years and months count as 365 and 30 days.
pub fn parse_xs_duration(input: &str) -> Option<Duration> {
    let (negative, rest) = match input.trim().strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input.trim()),
    };
    let rest = rest.strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return None,
        None => (rest, None),
    };

    let mut total = Duration::ZERO;
    let mut seen_any = false;
    let mut take = |part: &str, units: &[(char, Duration)]| -> Option<()> {
        let mut number = String::new();
        let mut unit_index = 0;
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            let position = units[unit_index..].iter().position(|(u, _)| *u == c)?;
            unit_index += position + 1;
            let value: f64 = number.parse().ok()?;
            total += units[unit_index - 1].1 * value;
            number.clear();
            seen_any = true;
        }
        number.is_empty().then_some(())
    };
    take(
        date,
        &[
            ('Y', Duration::days(365)),
            ('M', Duration::days(30)),
            ('D', Duration::days(1)),
        ],
    )?;
    if let Some(time) = time {
        take(
            time,
            &[
                ('H', Duration::hours(1)),
                ('M', Duration::minutes(1)),
                ('S', Duration::seconds(1)),
            ],
        )?;
    }
    if !seen_any {
        return None;
    }
    Some(if negative { -total } else { total })
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[cfg(feature = "xmlsec")]
pub(crate) mod xml {
    use libxml::{tree::Node, xpath::Object};

    use crate::ValidationFailure;

    pub const MD: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
    pub const DS: &str = "http://www.w3.org/2000/09/xmldsig#";
    pub const SAMLP: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
    pub const SAML: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
    pub const XENC: &str = "http://www.w3.org/2001/04/xmlenc#";
    pub const XENC11: &str = "http://www.w3.org/2009/xmlenc11#";

    pub fn single_node(object: &Object) -> Result<Node, ValidationFailure> {
        let mut nodes = object.get_nodes_as_vec();
        if nodes.len() != 1 {
            return Err(ValidationFailure::Malformed(format!(
                "expected exactly one element, found {}",
                nodes.len()
            )));
        }
        Ok(nodes.remove(0))
    }

    pub fn is_element(node: &Node, namespace: &str, local_name: &str) -> bool {
        node.get_name() == local_name
            && node
                .get_namespace()
                .map(|ns| ns.get_href() == namespace)
                .unwrap_or(false)
    }

    pub fn children(node: &Node, namespace: &str, local_name: &str) -> Vec<Node> {
        node.get_child_elements()
            .into_iter()
            .filter(|child| is_element(child, namespace, local_name))
            .collect()
    }

    pub fn optional_child(
        node: &Node,
        namespace: &str,
        local_name: &str,
    ) -> Result<Option<Node>, ValidationFailure> {
        let mut found = children(node, namespace, local_name);
        match found.len() {
            0 => Ok(None),
            1 => Ok(Some(found.remove(0))),
            n => Err(ValidationFailure::Malformed(format!(
                "{n} {local_name} elements where at most one is allowed"
            ))),
        }
    }

    pub fn required_child(
        node: &Node,
        namespace: &str,
        local_name: &str,
    ) -> Result<Node, ValidationFailure> {
        optional_child(node, namespace, local_name)?
            .ok_or_else(|| ValidationFailure::Malformed(format!("missing {local_name}")))
    }

    pub fn text(node: &Node) -> String {
        node.get_content().trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_strip_pem_armor() {
        let pem = b"-----BEGIN CERTIFICATE-----\nAAEC\nAw==\n-----END CERTIFICATE-----\n";
        assert_eq!(pem_to_der(pem).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(pem_to_der(&[0x30, 0x82]).unwrap(), vec![0x30, 0x82]);
    }

    #[test]
    fn can_parse_xs_durations() {
        assert_eq!(parse_xs_duration("PT604800S"), Some(Duration::days(7)));
        assert_eq!(parse_xs_duration("P1DT2H"), Some(Duration::hours(26)));
        assert_eq!(parse_xs_duration("PT1M30S"), Some(Duration::seconds(90)));
        assert_eq!(parse_xs_duration("P1M"), Some(Duration::days(30)));
        assert_eq!(parse_xs_duration("P"), None);
        assert_eq!(parse_xs_duration("PT"), None);
        assert_eq!(parse_xs_duration("1D"), None);
        assert_eq!(parse_xs_duration("PT5X"), None);
    }

    #[test]
    fn request_ids_are_ncnames() {
        let id = new_request_id();
        assert!(id.starts_with("_id"));
        assert_eq!(id.len(), 35);
        assert_ne!(id, new_request_id());
    }
}
