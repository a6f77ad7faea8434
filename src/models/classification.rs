use serde::{Deserialize, Serialize};

/// Content category of a request, as understood by the decision service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    #[default]
    Other,
    Script,
    Image,
    Stylesheet,
    Document,
    Subdocument,
    Object,
    XmlHttpRequest,
    Font,
    Media,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Other => "OTHER",
            ContentType::Script => "SCRIPT",
            ContentType::Image => "IMAGE",
            ContentType::Stylesheet => "STYLESHEET",
            ContentType::Document => "DOCUMENT",
            ContentType::Subdocument => "SUBDOCUMENT",
            ContentType::Object => "OBJECT",
            ContentType::XmlHttpRequest => "XMLHTTPREQUEST",
            ContentType::Font => "FONT",
            ContentType::Media => "MEDIA",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OTHER" => Some(ContentType::Other),
            "SCRIPT" => Some(ContentType::Script),
            "IMAGE" => Some(ContentType::Image),
            "STYLESHEET" => Some(ContentType::Stylesheet),
            "DOCUMENT" => Some(ContentType::Document),
            "SUBDOCUMENT" => Some(ContentType::Subdocument),
            "OBJECT" => Some(ContentType::Object),
            "XMLHTTPREQUEST" => Some(ContentType::XmlHttpRequest),
            "FONT" => Some(ContentType::Font),
            "MEDIA" => Some(ContentType::Media),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of classifying one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    pub content_type: ContentType,
    pub third_party: bool,
    pub block: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_round_trips_through_str() {
        for ct in [
            ContentType::Other,
            ContentType::Script,
            ContentType::XmlHttpRequest,
            ContentType::Media,
        ] {
            assert_eq!(ContentType::from_str(ct.as_str()), Some(ct));
        }
        assert_eq!(ContentType::from_str("stylesheet"), Some(ContentType::Stylesheet));
        assert_eq!(ContentType::from_str("popup"), None);
    }

    #[test]
    fn test_content_type_serializes_upper_case() {
        let json = serde_json::to_string(&ContentType::XmlHttpRequest).unwrap();
        assert_eq!(json, "\"XMLHTTPREQUEST\"");
    }
}
