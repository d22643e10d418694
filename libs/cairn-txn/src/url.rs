//! Parses an entry's `request.url` into one of the four forms named by the
//! processor's validation rules: `Type`, `Type/id`, `Type/id/_history/vid`,
//! `Type?query`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestUrl {
    TypeOnly { resource_type: String },
    ById { resource_type: String, id: String },
    ByVersion { resource_type: String, id: String, version_id: String },
    Search { resource_type: String, query: String },
}

impl RequestUrl {
    pub fn parse(url: &str) -> Option<Self> {
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (url, None),
        };
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let resource_type = segments.next()?.to_string();
        let rest: Vec<&str> = segments.collect();

        match (rest.as_slice(), query) {
            ([], None) => Some(RequestUrl::TypeOnly { resource_type }),
            ([], Some(q)) => Some(RequestUrl::Search { resource_type, query: q.to_string() }),
            ([id], None) => Some(RequestUrl::ById { resource_type, id: id.to_string() }),
            ([id, "_history", vid], None) => Some(RequestUrl::ByVersion {
                resource_type,
                id: id.to_string(),
                version_id: vid.to_string(),
            }),
            _ => None,
        }
    }

    pub fn resource_type(&self) -> &str {
        match self {
            RequestUrl::TypeOnly { resource_type }
            | RequestUrl::ById { resource_type, .. }
            | RequestUrl::ByVersion { resource_type, .. }
            | RequestUrl::Search { resource_type, .. } => resource_type,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            RequestUrl::ById { id, .. } | RequestUrl::ByVersion { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// FHIR `id` grammar: `[A-Za-z0-9\-\.]{1,64}`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_four_url_forms() {
        assert_eq!(RequestUrl::parse("Patient"), Some(RequestUrl::TypeOnly { resource_type: "Patient".to_string() }));
        assert_eq!(
            RequestUrl::parse("Patient/0"),
            Some(RequestUrl::ById { resource_type: "Patient".to_string(), id: "0".to_string() })
        );
        assert_eq!(
            RequestUrl::parse("Patient/0/_history/2"),
            Some(RequestUrl::ByVersion { resource_type: "Patient".to_string(), id: "0".to_string(), version_id: "2".to_string() })
        );
        assert_eq!(
            RequestUrl::parse("Patient?birthdate=2020"),
            Some(RequestUrl::Search { resource_type: "Patient".to_string(), query: "birthdate=2020".to_string() })
        );
    }

    #[test]
    fn malformed_path_segments_are_rejected() {
        assert_eq!(RequestUrl::parse("Patient/0/extra/garbage"), None);
    }

    #[test]
    fn id_validity_matches_fhir_id_grammar() {
        assert!(is_valid_id("abc-123.4"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has a space"));
    }
}
