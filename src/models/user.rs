//! Profile models

use serde::{Deserialize, Serialize};

/// A row in the `profiles` table.
///
/// The row is created by a trigger at signup with the name fields null;
/// they stay null until the user completes their profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl Profile {
    /// Human-facing name: "First Last" when both are set, otherwise the
    /// username, otherwise the raw id.
    pub fn display_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            _ => self.username.clone().unwrap_or_else(|| self.id.clone()),
        }
    }

    /// True once the user has filled in their username.
    pub fn is_complete(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(username: Option<&str>, first: Option<&str>, last: Option<&str>) -> Profile {
        Profile {
            id: "a1b2".to_string(),
            username: username.map(String::from),
            first_name: first.map(String::from),
            last_name: last.map(String::from),
        }
    }

    #[test]
    fn test_display_name_prefers_full_name() {
        let p = profile(Some("ada"), Some("Ada"), Some("Lovelace"));
        assert_eq!(p.display_name(), "Ada Lovelace");
    }

    #[test]
    fn test_display_name_falls_back_to_username() {
        let p = profile(Some("ada"), None, None);
        assert_eq!(p.display_name(), "ada");
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let p = profile(None, None, None);
        assert_eq!(p.display_name(), "a1b2");
    }

    #[test]
    fn test_is_complete() {
        assert!(profile(Some("ada"), None, None).is_complete());
        assert!(!profile(None, None, None).is_complete());
        assert!(!profile(Some(""), None, None).is_complete());
    }
}
