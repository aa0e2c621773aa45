// Copyright (C) 2026 ManorHunt
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;

use anyhow::{Context, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Cookie names are part of the webhook contract with deployed phones.
pub const STOP_COOKIE: &str = "Stop";
pub const CLUE_COOKIE: &str = "Clue";

/// Placeholder inside a `linked` segment's text, replaced with the absolute
/// video-page URL at reply time.
pub const URL_PLACEHOLDER: &str = "{url}";

/// Placeholder inside victory message text, replaced with the next stop key
/// (or [`FINAL_STOP_LABEL`] on the last stop).
pub const NEXT_STOP_PLACEHOLDER: &str = "{next_stop}";

pub const FINAL_STOP_LABEL: &str = "the finish line";

/// One deliverable piece of a reply or notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSegment {
    Plain { text: String },
    /// Text carrying a `{url}` placeholder resolved to the video page for
    /// `location`.
    Linked { text: String, location: String },
    /// Text plus exactly one media attachment.
    Media { text: String, url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Victory {
    pub messages: Vec<MessageSegment>,
    /// Next stop key, or empty for "no further stop".
    #[serde(default)]
    pub next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDefinition {
    pub key: String,
    pub introduction: Vec<MessageSegment>,
    /// Ordered clue-sets, revealed one per CLUE request, wrapping.
    pub clues: Vec<Vec<MessageSegment>>,
    pub victory: Victory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoEntry {
    pub title: String,
    pub file: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// The whole hunt, loaded once at startup and immutable afterwards.
///
/// `stops` is ordered: the first element is where a fresh game begins and
/// the last element is the designated final stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameScript {
    pub onboarding: Vec<MessageSegment>,
    pub stops: Vec<StopDefinition>,
    #[serde(default)]
    pub videos: HashMap<String, VideoEntry>,
}

impl GameScript {
    /// Parse and validate a script. Structural problems fail here, at
    /// startup, never at request time.
    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let script: GameScript =
            serde_yaml::from_str(raw).context("failed to parse hunt script yaml")?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.stops.is_empty() {
            bail!("hunt script has no stops");
        }
        if self.onboarding.is_empty() {
            bail!("hunt script has no onboarding messages");
        }
        self.check_segments("onboarding", &self.onboarding)?;

        let mut seen = std::collections::HashSet::new();
        for stop in &self.stops {
            if stop.key.trim().is_empty() {
                bail!("hunt script has a stop with an empty key");
            }
            if !seen.insert(stop.key.as_str()) {
                bail!("duplicate stop key {:?}", stop.key);
            }
        }

        for stop in &self.stops {
            if stop.clues.is_empty() {
                bail!("stop {:?} has no clue-sets", stop.key);
            }
            for (index, clue_set) in stop.clues.iter().enumerate() {
                if clue_set.is_empty() {
                    bail!("stop {:?} clue-set {index} is empty", stop.key);
                }
                self.check_segments(&format!("stop {:?} clue-set {index}", stop.key), clue_set)?;
            }
            self.check_segments(&format!("stop {:?} introduction", stop.key), &stop.introduction)?;
            self.check_segments(&format!("stop {:?} victory", stop.key), &stop.victory.messages)?;
            if !stop.victory.next.is_empty() && self.stop(&stop.victory.next).is_none() {
                bail!(
                    "stop {:?} victory points at unknown stop {:?}",
                    stop.key,
                    stop.victory.next
                );
            }
        }
        Ok(())
    }

    fn check_segments(&self, where_: &str, segments: &[MessageSegment]) -> anyhow::Result<()> {
        for segment in segments {
            if let MessageSegment::Linked { text, location } = segment {
                if !text.contains(URL_PLACEHOLDER) {
                    bail!("{where_}: linked segment text is missing the {URL_PLACEHOLDER} placeholder");
                }
                if !self.videos.contains_key(location) {
                    bail!("{where_}: linked segment references unknown video {location:?}");
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self, key: &str) -> Option<&StopDefinition> {
        self.stops.iter().find(|stop| stop.key == key)
    }

    /// Zero-based index into script order, used by the admin reset command.
    pub fn stop_by_index(&self, index: usize) -> Option<&StopDefinition> {
        self.stops.get(index)
    }

    pub fn first_stop(&self) -> &StopDefinition {
        // Validation guarantees at least one stop.
        &self.stops[0]
    }

    pub fn is_final_stop(&self, key: &str) -> bool {
        self.stops
            .last()
            .map(|stop| stop.key == key)
            .unwrap_or(false)
    }

    pub fn video(&self, location: &str) -> Option<&VideoEntry> {
        self.videos.get(location)
    }
}

/// Per-conversation progress, carried entirely in client-visible cookies.
///
/// The stop key is deliberately NOT checked against the script here; an
/// unknown key from a stale or tampered cookie surfaces as a lookup failure
/// in the handler, never a silent default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub stop: Option<String>,
    pub clue_index: u32,
}

impl ConversationState {
    pub fn from_cookies(stop: Option<&str>, clue: Option<&str>) -> Self {
        Self {
            stop: stop
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            clue_index: clue.and_then(|value| value.trim().parse().ok()).unwrap_or(0),
        }
    }

    pub fn stop_cookie_value(&self) -> String {
        self.stop.clone().unwrap_or_default()
    }

    pub fn clue_cookie_value(&self) -> String {
        self.clue_index.to_string()
    }
}

/// Replaces `{next_stop}` in segment text with the given label.
pub fn substitute_next_stop(segments: &[MessageSegment], label: &str) -> Vec<MessageSegment> {
    segments
        .iter()
        .map(|segment| match segment {
            MessageSegment::Plain { text } => MessageSegment::Plain {
                text: text.replace(NEXT_STOP_PLACEHOLDER, label),
            },
            MessageSegment::Linked { text, location } => MessageSegment::Linked {
                text: text.replace(NEXT_STOP_PLACEHOLDER, label),
                location: location.clone(),
            },
            MessageSegment::Media { text, url } => MessageSegment::Media {
                text: text.replace(NEXT_STOP_PLACEHOLDER, label),
                url: url.clone(),
            },
        })
        .collect()
}

/// Where absolute links point, derived from the inbound request's Host.
#[derive(Debug, Clone)]
pub struct LinkContext {
    scheme: String,
    host: String,
}

impl LinkContext {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    pub fn video_url(&self, location: &str) -> String {
        format!("{}://{}/video/{}", self.scheme, self.host, location)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub media: Option<String>,
}

/// An ordered TwiML messaging envelope: any number of messages, or one
/// redirect. A redirect suppresses the messages entirely, telling the
/// provider to re-invoke a different path with the same inbound payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagingReply {
    messages: Vec<OutboundMessage>,
    redirect: Option<String>,
}

impl MessagingReply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn redirect(target: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            redirect: Some(target.into()),
        }
    }

    pub fn push(&mut self, text: impl Into<String>) {
        self.messages.push(OutboundMessage {
            text: text.into(),
            media: None,
        });
    }

    pub fn push_with_media(&mut self, text: impl Into<String>, media: impl Into<String>) {
        self.messages.push(OutboundMessage {
            text: text.into(),
            media: Some(media.into()),
        });
    }

    pub fn push_segment(&mut self, segment: &MessageSegment, links: &LinkContext) {
        match segment {
            MessageSegment::Plain { text } => self.push(text.clone()),
            MessageSegment::Linked { text, location } => {
                self.push(text.replace(URL_PLACEHOLDER, &links.video_url(location)));
            }
            MessageSegment::Media { text, url } => self.push_with_media(text.clone(), url.clone()),
        }
    }

    pub fn push_segments(&mut self, segments: &[MessageSegment], links: &LinkContext) {
        for segment in segments {
            self.push_segment(segment, links);
        }
    }

    pub fn messages(&self) -> &[OutboundMessage] {
        &self.messages
    }

    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        if let Some(target) = &self.redirect {
            xml.push_str("<Response><Redirect>");
            xml.push_str(&xml_escape(target));
            xml.push_str("</Redirect></Response>");
            return xml;
        }
        if self.messages.is_empty() {
            xml.push_str("<Response />");
            return xml;
        }
        xml.push_str("<Response>");
        for message in &self.messages {
            match &message.media {
                Some(media) => {
                    xml.push_str("<Message><Body>");
                    xml.push_str(&xml_escape(&message.text));
                    xml.push_str("</Body><Media>");
                    xml.push_str(&xml_escape(media));
                    xml.push_str("</Media></Message>");
                }
                None => {
                    xml.push_str("<Message>");
                    xml.push_str(&xml_escape(&message.text));
                    xml.push_str("</Message>");
                }
            }
        }
        xml.push_str("</Response>");
        xml
    }
}

/// A spoken TwiML envelope: one `<Say>` with short pauses between segments,
/// then a hangup.
#[derive(Debug, Clone)]
pub struct VoiceReply {
    voice: String,
    segments: Vec<String>,
}

impl VoiceReply {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            segments: Vec::new(),
        }
    }

    pub fn say(&mut self, text: impl Into<String>) {
        self.segments.push(text.into());
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response>");
        if !self.segments.is_empty() {
            xml.push_str(&format!("<Say voice=\"{}\">", xml_escape(&self.voice)));
            for (index, segment) in self.segments.iter().enumerate() {
                if index > 0 {
                    xml.push_str("<break strength=\"x-weak\" time=\"100ms\"/>");
                }
                xml.push_str(&xml_escape(segment));
            }
            xml.push_str("</Say>");
        }
        xml.push_str("<Hangup/></Response>");
        xml
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Replace `${VAR_NAME}` patterns with environment variable values, so the
/// script file can reference deployment-specific bases (media URLs and the
/// like). Unknown or unset variables become an empty string.
pub fn expand_env_vars(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        lookup(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
