pub mod identity;

pub use identity::stable_media_id;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// One typed piece of a formatted message.
///
/// The upstream classifier turns a raw platform message into a list of
/// fragments; each variant knows what text of it should be embedded
/// ([`Fragment::content_text`]). Ids are assigned at composition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Fragment {
    Text {
        id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        url: Option<String>,
    },
    Image {
        id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        description: String,
        url: String,
        #[serde(default)]
        caption: String,
    },
    Gif {
        id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        description: String,
        url: String,
    },
    Link {
        id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        description: String,
        url: String,
    },
    Youtube {
        id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        description: String,
        url: String,
        #[serde(default)]
        channel: String,
        #[serde(default)]
        duration: String,
        #[serde(default)]
        thumbnail_url: Option<String>,
        #[serde(default)]
        video_id: Option<String>,
    },
}

impl Fragment {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            description: body.into(),
            url: None,
        }
    }

    pub fn image(url: impl Into<String>, caption: impl Into<String>) -> Self {
        Self::Image {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            description: String::new(),
            url: url.into(),
            caption: caption.into(),
        }
    }

    pub fn gif(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self::Gif {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: String::new(),
            url: url.into(),
        }
    }

    pub fn link(
        url: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::Link {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            url: url.into(),
        }
    }

    pub fn youtube(
        url: impl Into<String>,
        title: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self::Youtube {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: String::new(),
            url: url.into(),
            channel: channel.into(),
            duration: String::new(),
            thumbnail_url: None,
            video_id: None,
        }
    }

    /// Stable type tag, also the `kind` column of the persisted row.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Gif { .. } => "gif",
            Self::Link { .. } => "link",
            Self::Youtube { .. } => "youtube",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Text { id, .. }
            | Self::Image { id, .. }
            | Self::Gif { id, .. }
            | Self::Link { id, .. }
            | Self::Youtube { id, .. } => id,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Text { url, .. } => url.as_deref(),
            Self::Image { url, .. }
            | Self::Gif { url, .. }
            | Self::Link { url, .. }
            | Self::Youtube { url, .. } => Some(url.as_str()),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Text { title, .. }
            | Self::Image { title, .. }
            | Self::Gif { title, .. }
            | Self::Link { title, .. }
            | Self::Youtube { title, .. } => title,
        }
    }

    /// The text worth embedding for this fragment. Empty means the fragment
    /// carries nothing searchable and the projector skips it.
    pub fn content_text(&self) -> String {
        match self {
            Self::Text { description, .. } => description.trim().to_string(),
            Self::Image {
                caption,
                description,
                ..
            } => {
                let caption = caption.trim();
                if caption.is_empty() {
                    description.trim().to_string()
                } else {
                    caption.to_string()
                }
            }
            Self::Gif {
                title, description, ..
            } => join_nonempty(&[title, description]),
            Self::Link {
                title, description, ..
            } => join_nonempty(&[title, description]),
            Self::Youtube {
                title,
                channel,
                description,
                ..
            } => join_nonempty(&[title, channel, description]),
        }
    }

    /// Lazy per-read serialization. Never stored pre-rendered.
    pub fn render(&self, mode: RenderMode) -> Value {
        match mode {
            RenderMode::Full => serde_json::to_value(self).unwrap_or(Value::Null),
            RenderMode::Llm => self.render_llm(),
            RenderMode::Markdown => Value::String(self.render_markdown()),
        }
    }

    /// Trimmed view for prompting: type tag plus whatever fields carry
    /// signal, empty strings and internal ids dropped.
    fn render_llm(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), json!(self.kind()));

        let mut put = |key: &str, value: &str| {
            if !value.is_empty() {
                map.insert(key.into(), json!(value));
            }
        };

        match self {
            Self::Text { description, .. } => put("text", description),
            Self::Image { caption, url, .. } => {
                put("caption", caption);
                put("url", url);
            }
            Self::Gif { title, url, .. } => {
                put("title", title);
                put("url", url);
            }
            Self::Link {
                title,
                description,
                url,
                ..
            } => {
                put("title", title);
                put("description", description);
                put("url", url);
            }
            Self::Youtube {
                title,
                channel,
                duration,
                url,
                ..
            } => {
                put("title", title);
                put("channel", channel);
                put("duration", duration);
                put("url", url);
            }
        }
        Value::Object(map)
    }

    fn render_markdown(&self) -> String {
        let body = self.content_text();
        match self.url() {
            Some(url) if !body.is_empty() => format!("- [{}] {} ({})", self.kind(), body, url),
            Some(url) => format!("- [{}] {}", self.kind(), url),
            None => format!("- [{}] {}", self.kind(), body),
        }
    }
}

fn join_nonempty(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Serialization modes for the cache read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Trimmed for prompting.
    Llm,
    /// All persisted fields.
    Full,
    /// Human-readable bullet rendering.
    Markdown,
}

/// Formatted payload for one message: who said it and which typed fragments
/// the classifier extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoRecord {
    pub author: String,
    pub fragments: Vec<Fragment>,
}

impl MemoRecord {
    pub fn new(author: impl Into<String>, fragments: Vec<Fragment>) -> Self {
        Self {
            author: author.into(),
            fragments,
        }
    }

    /// Degraded record substituted when the formatter collaborator fails:
    /// the raw message content as a single text fragment.
    pub fn degraded(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            fragments: vec![Fragment::text(content)],
        }
    }

    pub fn render(&self, message_id: &str, mode: RenderMode) -> Value {
        match mode {
            RenderMode::Markdown => {
                let mut out = format!("**{}** ({message_id})", self.author);
                for fragment in &self.fragments {
                    out.push('\n');
                    out.push_str(&fragment.render_markdown());
                }
                Value::String(out)
            }
            mode => json!({
                "message_id": message_id,
                "author": self.author,
                "fragments": self
                    .fragments
                    .iter()
                    .map(|f| f.render(mode))
                    .collect::<Vec<_>>(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_serde() {
        let f = Fragment::image("https://x.test/a.png", "a cat");
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["type"], "image");
        assert_eq!(f.kind(), "image");
    }

    #[test]
    fn content_text_prefers_caption() {
        let f = Fragment::Image {
            id: "i".into(),
            title: String::new(),
            description: "fallback".into(),
            url: "https://x.test/a.png".into(),
            caption: "a cat".into(),
        };
        assert_eq!(f.content_text(), "a cat");
    }

    #[test]
    fn content_text_empty_for_blank_text() {
        assert!(Fragment::text("   ").content_text().is_empty());
    }

    #[test]
    fn youtube_content_joins_title_and_channel() {
        let f = Fragment::youtube("https://youtu.be/abc", "Title", "Chan");
        assert_eq!(f.content_text(), "Title | Chan");
    }

    #[test]
    fn llm_render_drops_empty_fields_and_ids() {
        let f = Fragment::gif("https://x.test/a.gif", "");
        let v = f.render(RenderMode::Llm);
        assert_eq!(v["type"], "gif");
        assert_eq!(v["url"], "https://x.test/a.gif");
        assert!(v.get("title").is_none());
        assert!(v.get("id").is_none());
    }

    #[test]
    fn full_render_keeps_ids() {
        let f = Fragment::text("hello");
        let v = f.render(RenderMode::Full);
        assert!(v.get("id").is_some());
        assert_eq!(v["description"], "hello");
    }

    #[test]
    fn markdown_render_is_a_bullet() {
        let f = Fragment::link("https://example.test/p", "Post", "about things");
        let line = f.render(RenderMode::Markdown);
        let line = line.as_str().unwrap();
        assert!(line.starts_with("- [link]"));
        assert!(line.contains("https://example.test/p"));
    }

    #[test]
    fn memo_record_markdown_includes_author() {
        let memo = MemoRecord::new("alice", vec![Fragment::text("hi")]);
        let v = memo.render("m1", RenderMode::Markdown);
        assert!(v.as_str().unwrap().starts_with("**alice** (m1)"));
    }

    #[test]
    fn degraded_record_wraps_raw_content() {
        let memo = MemoRecord::degraded("bob", "raw text");
        assert_eq!(memo.fragments.len(), 1);
        assert_eq!(memo.fragments[0].content_text(), "raw text");
    }

    #[test]
    fn serde_roundtrip_preserves_variant_extras() {
        let f = Fragment::Youtube {
            id: "y".into(),
            title: "t".into(),
            description: String::new(),
            url: "https://youtube.com/watch?v=abc123def45".into(),
            channel: "chan".into(),
            duration: "3:20".into(),
            thumbnail_url: Some("https://i.ytimg.test/abc.jpg".into()),
            video_id: Some("abc123def45".into()),
        };
        let raw = serde_json::to_string(&f).unwrap();
        let back: Fragment = serde_json::from_str(&raw).unwrap();
        assert_eq!(f, back);
    }
}
