//! Consultation session identity
//!
//! Who is calling whom. Identity is established by the hosting platform
//! before a call page loads; nothing here checks credentials.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Opaque identifier of one call endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which side of the offer/answer exchange this participant plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Immutable identity of one call page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub local_participant_id: ParticipantId,
    pub remote_participant_id: ParticipantId,
}

/// Everything the call page is opened with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBootstrap {
    pub session_id: String,
    pub local_participant_id: ParticipantId,
    pub remote_participant_id: ParticipantId,
    pub local_display_name: String,
    pub remote_display_name: String,
}

/// One entry of the call page roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub initials: String,
    pub is_local: bool,
}

impl SessionBootstrap {
    /// Parse and validate a bootstrap JSON document
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let bootstrap: SessionBootstrap = serde_json::from_str(json)
            .map_err(|e| crate::Error::InvalidConfig(format!("session bootstrap: {}", e)))?;
        bootstrap.validate()?;
        Ok(bootstrap)
    }

    /// Read a bootstrap JSON file
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check that both participants are named and distinct
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.session_id.trim().is_empty() {
            return Err(Error::InvalidConfig("session id is empty".to_string()));
        }
        if self.local_participant_id.is_empty() || self.remote_participant_id.is_empty() {
            return Err(Error::InvalidConfig(
                "participant ids must not be empty".to_string(),
            ));
        }
        if self.local_participant_id == self.remote_participant_id {
            return Err(Error::InvalidConfig(format!(
                "participant {} cannot call itself",
                self.local_participant_id
            )));
        }
        Ok(())
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            session_id: self.session_id.clone(),
            local_participant_id: self.local_participant_id.clone(),
            remote_participant_id: self.remote_participant_id.clone(),
        }
    }

    /// Local participant first, then the remote one
    pub fn participants(&self) -> Vec<Participant> {
        vec![
            Participant {
                id: self.local_participant_id.clone(),
                display_name: self.local_display_name.clone(),
                initials: initials(&self.local_display_name),
                is_local: true,
            },
            Participant {
                id: self.remote_participant_id.clone(),
                display_name: self.remote_display_name.clone(),
                initials: initials(&self.remote_display_name),
                is_local: false,
            },
        ]
    }
}

/// First letter of the first two words, upper-cased
///
/// "Ana María López" becomes "AM"; an empty name yields an empty string.
pub fn initials(display_name: &str) -> String {
    display_name
        .split_whitespace()
        .take(2)
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap() -> SessionBootstrap {
        SessionBootstrap {
            session_id: "appt-42".to_string(),
            local_participant_id: "student-7".into(),
            remote_participant_id: "psych-1".into(),
            local_display_name: "Lucía Fernández".to_string(),
            remote_display_name: "dra. elena ruiz soto".to_string(),
        }
    }

    #[test]
    fn test_initials() {
        assert_eq!(initials("Lucía Fernández"), "LF");
        assert_eq!(initials("dra. elena ruiz"), "DE");
        assert_eq!(initials("  Mónica "), "M");
        assert_eq!(initials(""), "");
    }

    #[test]
    fn test_participants_roster() {
        let roster = bootstrap().participants();
        assert_eq!(roster.len(), 2);
        assert!(roster[0].is_local);
        assert_eq!(roster[0].initials, "LF");
        assert_eq!(roster[1].id, ParticipantId::from("psych-1"));
        assert!(!roster[1].is_local);
    }

    #[test]
    fn test_validate() {
        assert!(bootstrap().validate().is_ok());

        let mut b = bootstrap();
        b.remote_participant_id = b.local_participant_id.clone();
        assert!(b.validate().is_err());

        let mut b = bootstrap();
        b.local_participant_id = "  ".into();
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_from_json() {
        let parsed = SessionBootstrap::from_json(
            r#"{
                "sessionId": "appt-42",
                "localParticipantId": "student-7",
                "remoteParticipantId": "psych-1",
                "localDisplayName": "Lucía Fernández",
                "remoteDisplayName": "dra. elena ruiz soto"
            }"#,
        )
        .unwrap();
        assert_eq!(parsed, bootstrap());

        let same_ids = r#"{"sessionId":"a","localParticipantId":"x","remoteParticipantId":"x",
            "localDisplayName":"X","remoteDisplayName":"X"}"#;
        assert!(SessionBootstrap::from_json(same_ids).is_err());
        assert!(SessionBootstrap::from_json("{}").is_err());
    }

    #[test]
    fn test_load_bootstrap_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootstrap.json");
        std::fs::write(&path, serde_json::to_string(&bootstrap()).unwrap()).unwrap();
        assert_eq!(SessionBootstrap::load(&path).unwrap(), bootstrap());

        assert!(SessionBootstrap::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_bootstrap_json_shape() {
        let json = serde_json::to_value(bootstrap()).unwrap();
        assert_eq!(json["sessionId"], "appt-42");
        assert_eq!(json["localParticipantId"], "student-7");
        assert_eq!(json["remoteDisplayName"], "dra. elena ruiz soto");

        let descriptor = bootstrap().descriptor();
        assert_eq!(descriptor.remote_participant_id.as_str(), "psych-1");
    }
}
