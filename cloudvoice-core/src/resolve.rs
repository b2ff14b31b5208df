//! Stream-type → server mode and locale → language resolution.
//!
//! Malformed locales are rejected, but a well-formed locale naming a language
//! the service does not support falls back to US English without error.

use serde::{Deserialize, Serialize};

use crate::error::{CloudVoiceError, Result};
use crate::ipc::events::StreamType;

/// Server-side robot mode for intent streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotMode {
    VoiceCommand,
    Game,
}

/// Which typed stream to open against the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "mode", rename_all = "snake_case")]
pub enum StreamKind {
    Intent(RobotMode),
    KnowledgeGraph,
    ConnectionCheck,
}

/// Language codes the service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageCode {
    EnglishUs,
    EnglishUk,
    EnglishAu,
    French,
    German,
}

const MODE_TABLE: &[(StreamType, StreamKind)] = &[
    (StreamType::Normal, StreamKind::Intent(RobotMode::VoiceCommand)),
    (StreamType::Blackjack, StreamKind::Intent(RobotMode::Game)),
    (StreamType::ConnectionCheck, StreamKind::ConnectionCheck),
];

/// Map a requested stream type to the stream the session should open.
///
/// # Errors
/// `CloudVoiceError::InvalidConfig` for a type that is neither in the mode
/// table nor a knowledge-graph request.
pub fn resolve_mode(stream_type: StreamType) -> Result<StreamKind> {
    if stream_type == StreamType::KnowledgeGraph {
        return Ok(StreamKind::KnowledgeGraph);
    }
    MODE_TABLE
        .iter()
        .find(|(t, _)| *t == stream_type)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| {
            CloudVoiceError::InvalidConfig(format!("no server mode for stream type {stream_type:?}"))
        })
}

/// Map a `lang-REGION` / `lang_REGION` locale to a language code.
///
/// # Errors
/// `CloudVoiceError::InvalidConfig` unless the locale has exactly two
/// separator-delimited segments.
pub fn resolve_language(locale: &str) -> Result<LanguageCode> {
    let parts: Vec<&str> = locale.split(['-', '_']).collect();
    let [language, region] = parts.as_slice() else {
        return Err(CloudVoiceError::InvalidConfig(format!(
            "unparsable locale {locale:?}"
        )));
    };

    let code = match language.to_ascii_lowercase().as_str() {
        "fr" => LanguageCode::French,
        "de" => LanguageCode::German,
        "en" => match region.to_ascii_uppercase().as_str() {
            "GB" => LanguageCode::EnglishUk,
            "AU" => LanguageCode::EnglishAu,
            _ => LanguageCode::EnglishUs,
        },
        _ => LanguageCode::EnglishUs,
    };
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn language_table() {
        let cases = [
            ("en-US", LanguageCode::EnglishUs),
            ("en-GB", LanguageCode::EnglishUk),
            ("en_AU", LanguageCode::EnglishAu),
            ("en-NZ", LanguageCode::EnglishUs),
            ("fr-FR", LanguageCode::French),
            ("fr-CA", LanguageCode::French),
            ("de-DE", LanguageCode::German),
            ("xx-YY", LanguageCode::EnglishUs),
        ];
        for (locale, expected) in cases {
            let got = resolve_language(locale)
                .unwrap_or_else(|e| panic!("{locale} should resolve: {e}"));
            assert_eq!(got, expected, "locale {locale}");
        }
    }

    #[test]
    fn malformed_locales_are_invalid_config() {
        for locale in ["badlocale", "", "en-US-x", "en_US-POSIX"] {
            let err = resolve_language(locale).expect_err(locale);
            assert_eq!(err.kind(), ErrorKind::InvalidConfig, "locale {locale:?}");
        }
    }

    #[test]
    fn mode_table() {
        assert_eq!(
            resolve_mode(StreamType::Normal).expect("normal"),
            StreamKind::Intent(RobotMode::VoiceCommand)
        );
        assert_eq!(
            resolve_mode(StreamType::Blackjack).expect("blackjack"),
            StreamKind::Intent(RobotMode::Game)
        );
        assert_eq!(
            resolve_mode(StreamType::ConnectionCheck).expect("connection check"),
            StreamKind::ConnectionCheck
        );
    }

    #[test]
    fn knowledge_graph_bypasses_table() {
        assert!(!MODE_TABLE
            .iter()
            .any(|(t, _)| *t == StreamType::KnowledgeGraph));
        assert_eq!(
            resolve_mode(StreamType::KnowledgeGraph).expect("kg"),
            StreamKind::KnowledgeGraph
        );
    }

    #[test]
    fn unknown_stream_type_is_invalid_config() {
        let err = resolve_mode(StreamType::Unknown).expect_err("unknown type");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
