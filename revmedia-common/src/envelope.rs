use serde::Deserialize;

/// Nested comment trees are walked at most this deep. The upstream data is
/// effectively flat, the cap only guards against pathological payloads.
pub const MAX_COMMENT_DEPTH: usize = 50;

/// A post as it arrives on the bus. Everything except the id and title is
/// optional in practice.
#[derive(Debug, Clone, Deserialize)]
pub struct PostEnvelope {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub ups: i64,
    #[serde(default)]
    pub downs: i64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub over_18: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentEnvelope {
    pub id: String,
    #[serde(default)]
    pub link_id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub ups: i64,
    #[serde(default)]
    pub downs: i64,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub children: Vec<CommentEnvelope>,
}

impl PostEnvelope {
    pub fn created(&self) -> i64 {
        self.created_utc as i64
    }
}

impl CommentEnvelope {
    /// The parent post's hexid; `link_id` comes prefixed with the upstream
    /// type tag `t3_`.
    pub fn post_hexid(&self) -> &str {
        self.link_id.strip_prefix("t3_").unwrap_or(&self.link_id)
    }

    pub fn created(&self) -> i64 {
        self.created_utc as i64
    }
}

#[derive(Debug, Clone)]
pub enum Envelope {
    Post(PostEnvelope),
    Comment(CommentEnvelope),
}

/// Decode one bus message. The presence of a `title` field is what makes a
/// payload a post.
pub fn decode(payload: &[u8]) -> serde_json::Result<Envelope> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if value.get("title").is_some() {
        serde_json::from_value(value).map(Envelope::Post)
    } else {
        serde_json::from_value(value).map(Envelope::Comment)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn title_makes_a_post() {
        let payload = br#"{"id":"abc123","title":"t","url":"http://x/y.jpg",
            "author":"someone","subreddit":"pics","created_utc":1500000000.0}"#;
        match decode(payload).unwrap() {
            Envelope::Post(post) => {
                assert_eq!("abc123", post.id);
                assert_eq!(1_500_000_000, post.created());
            }
            Envelope::Comment(_) => panic!("expected a post"),
        }
    }

    #[test]
    fn no_title_makes_a_comment() {
        let payload = br#"{"id":"def456","link_id":"t3_abc123","body":"[x](http://a/b.png)"}"#;
        match decode(payload).unwrap() {
            Envelope::Comment(comment) => {
                assert_eq!("abc123", comment.post_hexid());
                assert!(comment.children.is_empty());
            }
            Envelope::Post(_) => panic!("expected a comment"),
        }
    }

    #[test]
    fn malformed_payload_errors() {
        assert!(decode(b"not json").is_err());
    }
}
