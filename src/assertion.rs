use time::{Duration, OffsetDateTime};

use crate::{attributes::Attributes, ValidationFailure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
}

impl NameId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            format: None,
        }
    }

    pub fn with_format(self, format: impl Into<String>) -> Self {
        Self {
            format: Some(format.into()),
            ..self
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Conditions {
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    pub audiences: Vec<String>,
}

impl Conditions {
    /// Checks the validity window, widened by `skew` on both ends, and the
    /// audience restriction.
    pub fn check(
        &self,
        now: OffsetDateTime,
        skew: Duration,
        audience: &str,
    ) -> Result<(), ValidationFailure> {
        if let Some(not_before) = self.not_before {
            if now + skew < not_before {
                return Err(ValidationFailure::NotYetValid);
            }
        }

        if let Some(not_on_or_after) = self.not_on_or_after {
            if now - skew >= not_on_or_after {
                return Err(ValidationFailure::Expired);
            }
        }

        if !self.audiences.is_empty() && !self.audiences.iter().any(|a| a == audience) {
            return Err(ValidationFailure::AudienceMismatch);
        }

        Ok(())
    }
}

/// A validated assertion. Only the toolkit constructs these after every
/// signature, issuer, audience and time check has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    pub id: String,
    pub issuer: String,
    pub name_id: NameId,
    pub session_index: Option<String>,
    pub authn_instant: Option<OffsetDateTime>,
    pub authn_context_class: Option<String>,
    pub attributes: Attributes,
    pub conditions: Conditions,
}

impl Assertion {
    /// How long the assertion id must be remembered to block replays.
    pub fn replay_horizon(&self, now: OffsetDateTime, fallback: Duration) -> OffsetDateTime {
        self.conditions
            .not_on_or_after
            .unwrap_or(now + fallback)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const SP: &str = "https://app.example/saml/sp";

    fn window() -> Conditions {
        Conditions {
            not_before: Some(datetime!(2025-01-08 16:30:00 UTC)),
            not_on_or_after: Some(datetime!(2025-01-08 16:35:00 UTC)),
            audiences: vec![SP.to_string()],
        }
    }

    #[test]
    fn accepts_assertion_inside_window() {
        window()
            .check(datetime!(2025-01-08 16:31:18 UTC), Duration::ZERO, SP)
            .unwrap();
    }

    #[test]
    fn rejects_expired_assertion() {
        assert_eq!(
            window().check(datetime!(2025-01-08 16:35:00 UTC), Duration::ZERO, SP),
            Err(ValidationFailure::Expired)
        );
        assert_eq!(
            window().check(datetime!(2025-01-08 16:40:00 UTC), Duration::minutes(3), SP),
            Err(ValidationFailure::Expired)
        );
    }

    #[test]
    fn skew_widens_the_window() {
        let conditions = window();
        assert_eq!(
            conditions.check(datetime!(2025-01-08 16:28:00 UTC), Duration::ZERO, SP),
            Err(ValidationFailure::NotYetValid)
        );
        conditions
            .check(datetime!(2025-01-08 16:28:00 UTC), Duration::minutes(3), SP)
            .unwrap();
        conditions
            .check(datetime!(2025-01-08 16:36:00 UTC), Duration::minutes(3), SP)
            .unwrap();
    }

    #[test]
    fn rejects_foreign_audience() {
        assert_eq!(
            window().check(
                datetime!(2025-01-08 16:31:18 UTC),
                Duration::ZERO,
                "https://other.example"
            ),
            Err(ValidationFailure::AudienceMismatch)
        );
    }
}
