//! Types returned by the registry, search and geocoding collaborators.
//!
//! Field names follow the Companies House JSON payloads so responses can
//! be deserialized directly; every field is optional because the registry
//! omits whatever it does not hold for a given company.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Headcount per reporting period; `None` when a filing for the period
/// was found but no figure could be extracted.
pub type Headcount = BTreeMap<String, Option<u64>>;

/// A company profile from the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub company_number: Option<String>,
    #[serde(default)]
    pub company_status: Option<String>,
    #[serde(default)]
    pub registered_office_address: Option<Address>,
    #[serde(default)]
    pub sic_codes: Vec<String>,
}

impl Profile {
    /// The registered office address as a single line, if it has any parts.
    #[must_use]
    pub fn address_line(&self) -> Option<String> {
        self.registered_office_address
            .as_ref()
            .map(Address::format)
            .filter(|line| !line.is_empty())
    }
}

/// A postal address split into registry components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub premises: Option<String>,
    #[serde(default)]
    pub address_line_1: Option<String>,
    #[serde(default)]
    pub address_line_2: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl Address {
    /// Join the non-empty components with `", "`.
    #[must_use]
    pub fn format(&self) -> String {
        [
            &self.premises,
            &self.address_line_1,
            &self.address_line_2,
            &self.locality,
            &self.region,
            &self.postal_code,
            &self.country,
        ]
        .into_iter()
        .filter_map(|part| part.as_deref().map(str::trim))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
    }
}

/// One entry of a company's filing history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filing {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub made_up_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub filing_type: Option<String>,
    #[serde(default)]
    pub links: Option<FilingLinks>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingLinks {
    #[serde(default)]
    pub document_metadata: Option<String>,
}

impl Filing {
    /// Reporting period of the filing: the year of its made-up date.
    #[must_use]
    pub fn period(&self) -> Option<&str> {
        let date = self.made_up_date.as_deref()?;
        let year = date.get(..4)?;
        year.chars().all(|c| c.is_ascii_digit()).then_some(year)
    }

    /// Document id: the last path segment of the document metadata link.
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        self.links
            .as_ref()?
            .document_metadata
            .as_deref()?
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
    }
}

/// A resolved geographic position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
    /// Formatted place name reported by the geocoder.
    #[serde(default)]
    pub label: Option<String>,
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)?;
        if let Some(label) = self.label.as_deref().filter(|l| !l.is_empty()) {
            write!(f, " ({label})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_deserialize_with_address() {
        let json = r#"{
            "company_name": "ACME WIDGETS LIMITED",
            "company_number": "01234567",
            "registered_office_address": {
                "address_line_1": "1 High Street",
                "locality": "Leeds",
                "postal_code": "LS1 1AA",
                "country": "United Kingdom"
            }
        }"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert_eq!(
            profile.address_line().as_deref(),
            Some("1 High Street, Leeds, LS1 1AA, United Kingdom")
        );
        assert!(profile.sic_codes.is_empty());
    }

    #[test]
    fn test_blank_address_yields_no_line() {
        let profile = Profile {
            registered_office_address: Some(Address {
                premises: Some("  ".to_string()),
                ..Address::default()
            }),
            ..Profile::default()
        };
        assert_eq!(profile.address_line(), None);
    }

    #[test]
    fn test_filing_period_and_document_id() {
        let json = r#"{
            "category": "accounts",
            "made_up_date": "2023-03-31",
            "type": "AA",
            "links": {"document_metadata": "https://document-api.example/document/abc123"}
        }"#;
        let filing: Filing = serde_json::from_str(json).unwrap();
        assert_eq!(filing.period(), Some("2023"));
        assert_eq!(filing.document_id(), Some("abc123"));
        assert_eq!(filing.filing_type.as_deref(), Some("AA"));
    }

    #[test]
    fn test_filing_without_date_has_no_period() {
        let filing = Filing {
            made_up_date: Some("n/a".to_string()),
            ..Filing::default()
        };
        assert_eq!(filing.period(), None);
        assert_eq!(filing.document_id(), None);
    }

    #[test]
    fn test_coordinates_display() {
        let coords = Coordinates {
            lat: 53.8,
            lng: -1.55,
            label: Some("Leeds, UK".to_string()),
        };
        assert_eq!(coords.to_string(), "53.8,-1.55 (Leeds, UK)");

        let bare = Coordinates {
            lat: 1.0,
            lng: 2.5,
            label: None,
        };
        assert_eq!(bare.to_string(), "1,2.5");
    }
}
