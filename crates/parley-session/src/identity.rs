//! Stream identity, resolved once per announcement.
//!
//! Server stream ids follow `publisherId_mediaType_timestamp_random`; translation
//! streams use a `translated_` prefix and carry their target user only in metadata.
//! The explicit `isScreenShare` metadata flag wins over whatever the id says.

use crate::types::{MediaKind, MediaType, StreamMetadata};

/// UI id of this participant's own camera/microphone stream.
pub const LOCAL_STREAM_ID: &str = "local";

const TRANSLATED_PREFIX: &str = "translated_";

/// Which logical stream (and so which UI aggregate) a track belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamClass {
    /// Camera video or microphone audio; both share one aggregate.
    Camera(MediaKind),
    ScreenVideo,
    ScreenAudio,
    /// Interpreted audio for `publisher_id`, kept apart from the original microphone.
    Translated,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    pub server_stream_id: String,
    /// The participant this stream is shown for. For translations this is the
    /// translated speaker, not the interpreter.
    pub publisher_id: String,
    pub class: StreamClass,
}

impl StreamIdentity {
    /// Build an identity from a server stream id plus whatever hints came with it.
    ///
    /// Returns `None` when neither the id nor the hints name a publisher and a
    /// media type.
    pub fn resolve(
        stream_id: &str,
        publisher_hint: Option<&str>,
        kind_hint: Option<MediaKind>,
        metadata: &StreamMetadata,
    ) -> Option<Self> {
        if stream_id.starts_with(TRANSLATED_PREFIX) {
            let target = metadata.target_user_id.as_deref()?;
            return Some(Self {
                server_stream_id: stream_id.to_owned(),
                publisher_id: target.to_owned(),
                class: StreamClass::Translated,
            });
        }

        let parsed = parse_stream_id(stream_id);
        let publisher_id = metadata
            .publisher_id
            .as_deref()
            .or(publisher_hint)
            .or(parsed.as_ref().map(|(p, _)| p.as_str()))?
            .to_owned();

        let media_type = metadata
            .media_type
            .or(parsed.map(|(_, t)| t))
            .or_else(|| {
                kind_hint.map(|k| match k {
                    MediaKind::Video => MediaType::Video,
                    MediaKind::Audio => MediaType::Audio,
                })
            })?;

        let screen = metadata.is_screen_share.unwrap_or(media_type.is_screen());
        let class = match (screen, media_type.kind()) {
            (true, MediaKind::Video) => StreamClass::ScreenVideo,
            (true, MediaKind::Audio) => StreamClass::ScreenAudio,
            (false, kind) => StreamClass::Camera(kind),
        };

        Some(Self {
            server_stream_id: stream_id.to_owned(),
            publisher_id,
            class,
        })
    }

    pub fn is_screen_share(&self) -> bool {
        matches!(self.class, StreamClass::ScreenVideo | StreamClass::ScreenAudio)
    }

    pub fn is_translation(&self) -> bool {
        self.class == StreamClass::Translated
    }

    pub fn kind(&self) -> MediaKind {
        match self.class {
            StreamClass::Camera(kind) => kind,
            StreamClass::ScreenVideo => MediaKind::Video,
            StreamClass::ScreenAudio | StreamClass::Translated => MediaKind::Audio,
        }
    }

    /// Id of the UI aggregate this stream renders into.
    pub fn ui_stream_id(&self) -> String {
        let publisher = &self.publisher_id;
        match self.class {
            StreamClass::Camera(_) => format!("remote-{publisher}-media"),
            StreamClass::ScreenVideo => format!("screen-{publisher}"),
            StreamClass::ScreenAudio => format!("remote-{publisher}-screen_audio"),
            StreamClass::Translated => format!("remote-{publisher}-translated"),
        }
    }

    /// Whether the entry lives in the dedicated screen-stream list.
    pub fn in_screen_list(&self) -> bool {
        self.is_screen_share()
    }
}

/// UI id of a placeholder entry for a participant without renderable media.
pub fn presence_stream_id(publisher_id: &str) -> String {
    format!("remote-{publisher_id}-presence")
}

/// Split `publisherId_mediaType_timestamp_random` into publisher and media type.
///
/// Publisher ids may themselves contain underscores; the media type is located
/// from the right.
pub fn parse_stream_id(stream_id: &str) -> Option<(String, MediaType)> {
    let tokens: Vec<&str> = stream_id.split('_').collect();
    let n = tokens.len();
    if n < 4 {
        return None;
    }

    let (publisher_tokens, media_type) = match tokens.get(n - 4..n - 2) {
        Some(["screen", "audio"]) if n >= 5 => (tokens.get(..n - 4)?, MediaType::ScreenAudio),
        _ => {
            let media_type = match *tokens.get(n - 3)? {
                "video" => MediaType::Video,
                "audio" => MediaType::Audio,
                "screen" => MediaType::Screen,
                _ => return None,
            };
            (tokens.get(..n - 3)?, media_type)
        }
    };

    let publisher = publisher_tokens.join("_");
    if publisher.is_empty() {
        return None;
    }
    Some((publisher, media_type))
}
