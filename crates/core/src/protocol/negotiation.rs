//! Media negotiation messages.
//!
//! After the WebSocket upgrade the server sends a `media-offer` text frame
//! describing the stream; the client answers with `media-answer`. The
//! answer's `accepted` flag is honored both at the top level (the wire
//! contract) and nested under `payload` (what browser clients actually
//! send); key order and whitespace are irrelevant.

use serde::{Deserialize, Serialize};

use crate::media::{AudioInfo, Codec};

/// Outgoing `media-offer` envelope.
#[derive(Debug, Serialize)]
pub struct MediaOffer {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: OfferPayload,
}

#[derive(Debug, Serialize)]
pub struct OfferPayload {
    pub version: u32,
    pub streams: Vec<StreamDescription>,
}

/// One stream advertised in the offer.
#[derive(Debug, Serialize)]
pub struct StreamDescription {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framerate: Option<f64>,
    #[serde(rename = "sampleRate", skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<i32>,
}

impl MediaOffer {
    /// Build the offer for a video stream plus an optional audio track.
    pub fn new(codec: Codec, fps: f64, audio: Option<&AudioInfo>) -> Self {
        let mut streams = vec![StreamDescription {
            kind: "video",
            codec: codec.name().to_string(),
            framerate: Some(fps),
            sample_rate: None,
            channels: None,
        }];

        if let Some(audio) = audio {
            streams.push(StreamDescription {
                kind: "audio",
                codec: audio.codec_name.clone(),
                framerate: None,
                sample_rate: Some(audio.sample_rate),
                channels: Some(audio.channels),
            });
        }

        MediaOffer {
            kind: "media-offer",
            payload: OfferPayload {
                version: 1,
                streams,
            },
        }
    }

    /// Serialize to the JSON text sent in the offer frame.
    pub fn to_json(&self) -> String {
        // Serialization of this plain struct cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Incoming `media-answer` envelope.
#[derive(Debug, Deserialize)]
pub struct MediaAnswer {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    accepted: Option<bool>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    payload: Option<AnswerPayload>,
}

#[derive(Debug, Deserialize)]
struct AnswerPayload {
    #[serde(default)]
    accepted: Option<bool>,
    #[serde(default)]
    reason: Option<String>,
}

impl MediaAnswer {
    /// Parse an answer from JSON text. `None` for unparseable input or a
    /// different message type.
    pub fn parse(text: &str) -> Option<Self> {
        let answer: MediaAnswer = serde_json::from_str(text).ok()?;
        if answer.kind != "media-answer" {
            return None;
        }
        Some(answer)
    }

    /// Effective accepted flag: top-level, or nested under `payload`.
    pub fn accepted(&self) -> bool {
        self.accepted
            .or_else(|| self.payload.as_ref().and_then(|p| p.accepted))
            .unwrap_or(false)
    }

    /// Rejection reason, wherever the client put it.
    pub fn reason(&self) -> Option<&str> {
        self.reason
            .as_deref()
            .or_else(|| self.payload.as_ref().and_then(|p| p.reason.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_video_only() {
        let offer = MediaOffer::new(Codec::H264, 25.0, None);
        let json = offer.to_json();
        assert!(json.contains("\"type\":\"media-offer\""));
        assert!(json.contains("\"version\":1"));
        assert!(json.contains("\"codec\":\"h264\""));
        assert!(json.contains("\"framerate\":25.0"));
        assert!(!json.contains("sampleRate"));
    }

    #[test]
    fn offer_with_audio() {
        let audio = AudioInfo {
            codec_name: "aac".into(),
            sample_rate: 44100,
            channels: 2,
        };
        let json = MediaOffer::new(Codec::H265, 30.0, Some(&audio)).to_json();
        assert!(json.contains("\"codec\":\"h265\""));
        assert!(json.contains("\"type\":\"audio\""));
        assert!(json.contains("\"sampleRate\":44100"));
        assert!(json.contains("\"channels\":2"));
    }

    #[test]
    fn answer_flat_accepted() {
        let answer = MediaAnswer::parse(r#"{"type":"media-answer","accepted":true}"#).unwrap();
        assert!(answer.accepted());
    }

    #[test]
    fn answer_nested_accepted() {
        let answer =
            MediaAnswer::parse(r#"{"type":"media-answer","payload":{"accepted":true}}"#).unwrap();
        assert!(answer.accepted());
    }

    #[test]
    fn answer_rejected_with_reason() {
        let answer = MediaAnswer::parse(
            r#"{"type":"media-answer","accepted":false,"reason":"no codec"}"#,
        )
        .unwrap();
        assert!(!answer.accepted());
        assert_eq!(answer.reason(), Some("no codec"));
    }

    #[test]
    fn answer_tolerates_whitespace_and_key_order() {
        let answer = MediaAnswer::parse(
            "{\n  \"accepted\" : true ,\n  \"type\" : \"media-answer\"\n}",
        )
        .unwrap();
        assert!(answer.accepted());
    }

    #[test]
    fn answer_missing_accepted_defaults_false() {
        let answer = MediaAnswer::parse(r#"{"type":"media-answer"}"#).unwrap();
        assert!(!answer.accepted());
    }

    #[test]
    fn wrong_type_is_none() {
        assert!(MediaAnswer::parse(r#"{"type":"media-offer"}"#).is_none());
        assert!(MediaAnswer::parse("not json").is_none());
    }
}
