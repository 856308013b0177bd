//! # 中继模式

use std::fmt;

/// 由请求路径决定的中继模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RelayMode {
    #[default]
    Unknown,
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    ImagesGenerations,
    ImagesEdits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    VideoGenerations,
    Proxy,
}

impl RelayMode {
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/v1/chat/completions") {
            Self::ChatCompletions
        } else if path.starts_with("/v1/completions") {
            Self::Completions
        } else if path.starts_with("/v1/embeddings") || path.ends_with("embeddings") {
            Self::Embeddings
        } else if path.starts_with("/v1/moderations") {
            Self::Moderations
        } else if path.starts_with("/v1/images/generations") {
            Self::ImagesGenerations
        } else if path.starts_with("/v1/images/edits") {
            Self::ImagesEdits
        } else if path.starts_with("/v1/audio/speech") {
            Self::AudioSpeech
        } else if path.starts_with("/v1/audio/transcriptions") {
            Self::AudioTranscription
        } else if path.starts_with("/v1/audio/translations") {
            Self::AudioTranslation
        } else if path.starts_with("/v1/videos/generations") {
            Self::VideoGenerations
        } else if path.starts_with("/v1/proxy") {
            Self::Proxy
        } else {
            Self::Unknown
        }
    }

    /// 走文本控制器的模式
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(
            self,
            Self::ChatCompletions | Self::Completions | Self::Embeddings | Self::Moderations
        )
    }

    #[must_use]
    pub const fn is_audio(self) -> bool {
        matches!(
            self,
            Self::AudioSpeech | Self::AudioTranscription | Self::AudioTranslation
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::Moderations => "moderations",
            Self::ImagesGenerations => "images_generations",
            Self::ImagesEdits => "images_edits",
            Self::AudioSpeech => "audio_speech",
            Self::AudioTranscription => "audio_transcription",
            Self::AudioTranslation => "audio_translation",
            Self::VideoGenerations => "video_generations",
            Self::Proxy => "proxy",
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/v1/chat/completions", RelayMode::ChatCompletions)]
    #[case("/v1/completions", RelayMode::Completions)]
    #[case("/v1/engines/text-embedding-ada-002/embeddings", RelayMode::Embeddings)]
    #[case("/v1/images/edits", RelayMode::ImagesEdits)]
    #[case("/v1/audio/translations", RelayMode::AudioTranslation)]
    #[case("/v1/videos/generations", RelayMode::VideoGenerations)]
    #[case("/v1/proxy/3/v1/files", RelayMode::Proxy)]
    #[case("/v1/models", RelayMode::Unknown)]
    fn test_mode_from_path(#[case] path: &str, #[case] expected: RelayMode) {
        assert_eq!(RelayMode::from_path(path), expected);
    }
}
