//! Session and participant model shared by the client, the relay and the
//! session service.
//!
//! Field names serialize in camelCase to match the session service's JSON.

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, ToSmolStr, format_smolstr};

use crate::error::ValidationError;

/// Opaque session identifier.
pub type SessionId = SmolStr;

/// Opaque participant identifier, generated by the session service at join time.
pub type ParticipantId = SmolStr;

/// Length of generated session ids.
pub const SESSION_ID_LENGTH: usize = 8;

/// Longest accepted display name, in chars.
pub const MAX_USERNAME_LEN: usize = 50;

const SESSION_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Predefined participant colours.
pub const PARTICIPANT_COLORS: [&str; 6] = [
    "hsl(37, 92%, 50%)",  // Orange
    "hsl(200, 70%, 50%)", // Blue
    "hsl(150, 60%, 45%)", // Green
    "hsl(280, 60%, 55%)", // Purple
    "hsl(350, 70%, 55%)", // Red
    "hsl(180, 60%, 45%)", // Teal
];

/// Languages with editor support and a starter template.
const LANGUAGE_TEMPLATES: [(&str, &str); 14] = [
    (
        "javascript",
        "// Starting code here\nconsole.log('Hello JavaScript');\n",
    ),
    (
        "typescript",
        "// Starting code here\nconsole.log('Hello TypeScript');\n",
    ),
    ("python", "# Starting code here\nprint('Hello Python')\n"),
    (
        "java",
        "// Starting code here\npublic class Main {\n    public static void main(String[] args) {\n        System.out.println(\"Hello Java\");\n    }\n}\n",
    ),
    (
        "cpp",
        "// Starting code here\n#include <iostream>\n\nint main() {\n    std::cout << \"Hello C++\" << std::endl;\n    return 0;\n}\n",
    ),
    (
        "csharp",
        "// Starting code here\nusing System;\n\nclass Program {\n    static void Main() {\n        Console.WriteLine(\"Hello C#\");\n    }\n}\n",
    ),
    (
        "go",
        "// Starting code here\npackage main\n\nimport \"fmt\"\n\nfunc main() {\n    fmt.Println(\"Hello Go\")\n}\n",
    ),
    (
        "rust",
        "// Starting code here\nfn main() {\n    println!(\"Hello Rust\");\n}\n",
    ),
    ("ruby", "# Starting code here\nputs 'Hello Ruby'\n"),
    ("php", "<?php\n// Starting code here\necho \"Hello PHP\";\n"),
    ("sql", "-- Starting code here\nSELECT 'Hello SQL';\n"),
    (
        "html",
        "<!-- Starting code here -->\n<!DOCTYPE html>\n<html>\n<body>\n    <h1>Hello HTML</h1>\n</body>\n</html>\n",
    ),
    (
        "css",
        "/* Starting code here */\nbody {\n    font-family: sans-serif;\n}\n",
    ),
    ("json", "{\n    \"message\": \"Hello JSON\"\n}\n"),
];

/// Programming language tag for a session.
///
/// Tags outside the known set are carried through untouched; callers that care
/// can check [`Language::is_known`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Language(SmolStr);

impl Language {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_ascii_lowercase().to_smolstr())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this tag is one of the languages the editor knows about.
    pub fn is_known(&self) -> bool {
        self.template().is_some()
    }

    /// Starter code for a fresh session in this language.
    pub fn template(&self) -> Option<&'static str> {
        LANGUAGE_TEMPLATES
            .iter()
            .find(|(tag, _)| *tag == self.as_str())
            .map(|(_, template)| *template)
    }

    /// Title-cased name for display ("python" -> "Python").
    pub fn display_name(&self) -> String {
        let mut chars = self.0.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// All known language tags.
    pub fn known() -> impl Iterator<Item = Language> {
        LANGUAGE_TEMPLATES.iter().map(|(tag, _)| Language::new(tag))
    }
}

impl Default for Language {
    fn default() -> Self {
        Self::new("javascript")
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Language {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// A participant in a session roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub username: SmolStr,
    pub color: SmolStr,
    #[serde(default)]
    pub is_typing: bool,
    /// Unix timestamp (milliseconds) of last activity.
    pub last_activity: i64,
}

/// Full snapshot of a session as held by the session service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub code: String,
    pub language: Language,
    /// Roster ordered by join time.
    #[serde(default)]
    pub users: Vec<Participant>,
    /// Unix timestamp (milliseconds) of creation.
    pub created_at: i64,
    /// Author of the most recent code update made through the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<ParticipantId>,
    /// Monotonic counter bumped by every mutation. Older services omit it.
    #[serde(default)]
    pub revision: u64,
}

impl Session {
    /// Look up a participant by id.
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.users.iter_mut().find(|u| u.id == id)
    }

    /// Case-insensitive check against the roster.
    pub fn is_username_taken(&self, username: &str) -> bool {
        let wanted = username.trim().to_lowercase();
        self.users
            .iter()
            .any(|u| u.username.to_lowercase() == wanted)
    }

    /// Colours already assigned to participants.
    pub fn colors_in_use(&self) -> Vec<&str> {
        self.users.iter().map(|u| u.color.as_str()).collect()
    }

    /// Participants currently flagged as typing, excluding `except`.
    pub fn typing_participants<'a>(
        &'a self,
        except: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Participant> + 'a {
        self.users
            .iter()
            .filter(move |u| u.is_typing && Some(u.id.as_str()) != except)
    }
}

/// Result of running code in the sandbox.
///
/// Failures are data: a populated `error` rather than an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "executionTime")]
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            output: output.into(),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(output: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            output: output.into(),
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Pick a colour for a new participant.
///
/// Chooses randomly among palette entries not yet in use; once the palette is
/// exhausted a random hue is generated.
pub fn pick_color<R: Rng + ?Sized>(in_use: &[&str], rng: &mut R) -> SmolStr {
    let available: Vec<&str> = PARTICIPANT_COLORS
        .iter()
        .copied()
        .filter(|c| !in_use.contains(c))
        .collect();

    match available.choose(rng) {
        Some(color) => SmolStr::new(color),
        None => {
            let hue: u16 = rng.random_range(0..360);
            format_smolstr!("hsl({hue}, 60%, 50%)")
        }
    }
}

/// Generate a fresh session id of [`SESSION_ID_LENGTH`] lowercase alphanumerics.
pub fn generate_session_id() -> SessionId {
    let mut rng = rand::rng();
    (0..SESSION_ID_LENGTH)
        .map(|_| SESSION_ID_ALPHABET[rng.random_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect::<String>()
        .into()
}

/// Generate a participant id (UUID v4).
pub fn generate_participant_id() -> ParticipantId {
    uuid::Uuid::new_v4().to_smolstr()
}

/// Validate and normalize a display name. Returns the trimmed name.
pub fn validate_username(username: &str) -> Result<&str, ValidationError> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidUsername {
            reason: "username must not be empty",
        });
    }
    if trimmed.chars().count() > MAX_USERNAME_LEN {
        return Err(ValidationError::InvalidUsername {
            reason: "username must be at most 50 characters",
        });
    }
    Ok(trimmed)
}

/// Reject session ids that could not have come from the session service.
pub fn validate_session_id(id: &str) -> Result<(), ValidationError> {
    let well_formed = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::MalformedSessionId { id: id.into() })
    }
}

/// Current time as unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(name: &str, color: &str) -> Participant {
        Participant {
            id: generate_participant_id(),
            username: name.into(),
            color: color.into(),
            is_typing: false,
            last_activity: 0,
        }
    }

    #[test]
    fn test_language_templates() {
        assert!(Language::new("Python").is_known());
        assert_eq!(Language::new(" RUST ").as_str(), "rust");
        assert!(
            Language::new("rust")
                .template()
                .unwrap()
                .contains("Hello Rust")
        );
        assert!(!Language::new("cobol").is_known());
        assert_eq!(Language::new("cobol").template(), None);
        assert_eq!(Language::known().count(), 14);
        assert_eq!(Language::new("python").display_name(), "Python");
    }

    #[test]
    fn test_username_taken_case_insensitive() {
        let session = Session {
            id: "abc12345".into(),
            code: String::new(),
            language: Language::default(),
            users: vec![participant("Alice", PARTICIPANT_COLORS[0])],
            created_at: 0,
            last_modified_by: None,
            revision: 0,
        };
        assert!(session.is_username_taken("alice"));
        assert!(session.is_username_taken("  ALICE "));
        assert!(!session.is_username_taken("bob"));
    }

    #[test]
    fn test_pick_color_avoids_collisions() {
        let mut rng = rand::rng();
        let in_use = &PARTICIPANT_COLORS[..5];
        for _ in 0..20 {
            assert_eq!(pick_color(in_use, &mut rng), PARTICIPANT_COLORS[5]);
        }

        let color = pick_color(&PARTICIPANT_COLORS, &mut rng);
        assert!(color.starts_with("hsl("));
        assert!(color.ends_with(", 60%, 50%)"));
    }

    #[test]
    fn test_session_id_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), SESSION_ID_LENGTH);
        assert!(validate_session_id(&id).is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc").is_err());
    }

    #[test]
    fn test_validate_username() {
        assert_eq!(validate_username("  bob "), Ok("bob"));
        assert!(validate_username("   ").is_err());
        assert!(validate_username(&"x".repeat(51)).is_err());
    }

    #[test]
    fn test_session_json_shape() {
        let json = r#"{
            "id": "a1b2c3d4",
            "code": "print(1)",
            "language": "python",
            "users": [{"id": "u1", "username": "al", "color": "hsl(37, 92%, 50%)", "isTyping": true, "lastActivity": 5}],
            "createdAt": 1701734400000,
            "lastModifiedBy": "u1"
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.language, Language::new("python"));
        assert_eq!(session.last_modified_by.as_deref(), Some("u1"));
        assert_eq!(session.revision, 0);
        assert!(session.users[0].is_typing);

        let result = ExecutionResult::success("hi", 3);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["executionTime"], 3);
        assert!(value.get("error").is_none());
    }
}
