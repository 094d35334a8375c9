use std::collections::HashMap;

use time::{Duration, OffsetDateTime};

use crate::authn_request::ProtocolBinding;

/// The parts of an IdP's metadata document the SP relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct IdpMetadata {
    pub entity_id: String,
    pub signing_certificates: Vec<Vec<u8>>,
    pub sso_bindings: HashMap<ProtocolBinding, String>,
    pub slo_bindings: HashMap<ProtocolBinding, String>,
    pub valid_until: Option<OffsetDateTime>,
    pub cache_duration: Option<Duration>,
}

impl IdpMetadata {
    /// Requests are always sent with the redirect binding.
    pub fn sso_url(&self) -> Option<&str> {
        self.sso_bindings
            .get(&ProtocolBinding::Redirect)
            .map(String::as_str)
    }

    pub fn slo_url(&self) -> Option<&str> {
        self.slo_bindings
            .get(&ProtocolBinding::Redirect)
            .map(String::as_str)
    }
}

#[cfg(feature = "xmlsec")]
pub use self::parse::parse_idp_metadata;

#[cfg(feature = "xmlsec")]
mod parse {
    use std::collections::HashMap;

    use libxml::{parser::Parser as XmlParser, tree::Node, xpath::Context};
    use time::{format_description::well_known::Iso8601, OffsetDateTime};

    use super::IdpMetadata;
    use crate::{
        authn_request::ProtocolBinding,
        utils::{
            decode_xml_base64, parse_xs_duration,
            xml::{children, optional_child, required_child, single_node, text, DS, MD},
        },
        ValidationFailure,
    };

    fn malformed(reason: &str) -> ValidationFailure {
        ValidationFailure::Malformed(reason.to_string())
    }

    fn endpoints(descriptor: &Node, local_name: &str) -> HashMap<ProtocolBinding, String> {
        children(descriptor, MD, local_name)
            .into_iter()
            .filter_map(|node| {
                let binding = node.get_attribute("Binding")?.parse().ok()?;
                let location = node.get_attribute("Location")?;
                Some((binding, location))
            })
            .collect()
    }

    fn signing_certificates(descriptor: &Node) -> Result<Vec<Vec<u8>>, ValidationFailure> {
        let mut certificates = Vec::new();
        for key_descriptor in children(descriptor, MD, "KeyDescriptor") {
            // A KeyDescriptor without `use` is valid for both purposes.
            if key_descriptor
                .get_attribute("use")
                .is_some_and(|key_use| key_use != "signing")
            {
                continue;
            }
            let Some(key_info) = optional_child(&key_descriptor, DS, "KeyInfo")? else {
                continue;
            };
            for x509_data in children(&key_info, DS, "X509Data") {
                for certificate in children(&x509_data, DS, "X509Certificate") {
                    certificates.push(
                        decode_xml_base64(&text(&certificate))
                            .map_err(|_| malformed("undecodable X509Certificate"))?,
                    );
                }
            }
        }
        Ok(certificates)
    }

    pub fn parse_idp_metadata(input: &[u8]) -> Result<IdpMetadata, ValidationFailure> {
        let parser = XmlParser::default();
        let document = parser
            .parse_string(input)
            .map_err(|_| malformed("metadata is not well-formed XML"))?;

        let mut context =
            Context::new(&document).map_err(|_| malformed("cannot create XPath context"))?;
        context
            .register_namespace("md", MD)
            .map_err(|_| malformed("cannot register namespace"))?;

        let entity = single_node(
            &context
                .evaluate("//md:EntityDescriptor[md:IDPSSODescriptor]")
                .map_err(|_| malformed("no IdP EntityDescriptor"))?,
        )?;
        let entity_id = entity
            .get_attribute("entityID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed("EntityDescriptor without entityID"))?;
        let valid_until = entity
            .get_attribute("validUntil")
            .map(|value| {
                OffsetDateTime::parse(&value, &Iso8601::DEFAULT)
                    .map_err(|_| malformed("invalid validUntil"))
            })
            .transpose()?;
        let cache_duration = entity
            .get_attribute("cacheDuration")
            .map(|value| parse_xs_duration(&value).ok_or_else(|| malformed("invalid cacheDuration")))
            .transpose()?;

        let descriptor = required_child(&entity, MD, "IDPSSODescriptor")?;

        Ok(IdpMetadata {
            entity_id,
            signing_certificates: signing_certificates(&descriptor)?,
            sso_bindings: endpoints(&descriptor, "SingleSignOnService"),
            slo_bindings: endpoints(&descriptor, "SingleLogoutService"),
            valid_until,
            cache_duration,
        })
    }

}
