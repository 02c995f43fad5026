//! Relay line protocol
//!
//! `HSHK::<name>` opens a connection, after that every line is
//! `<KIND>::field::field::...::`. Fields are positional per kind.

use thiserror::Error;

/// Priority used for relayed chat lines.
pub const CHAT_PRIORITY: u8 = 5;

const SEPARATOR: &str = "::";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Chat,
    Staff,
    Death,
    Emote,
    Say,
    System,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Chat,
        MessageKind::Staff,
        MessageKind::Death,
        MessageKind::Emote,
        MessageKind::Say,
        MessageKind::System,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Self::Chat => "MSG",
            Self::Staff => "STF",
            Self::Death => "DTH",
            Self::Emote => "ME",
            Self::Say => "SAY",
            Self::System => "SYS",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// Fields the channel template consumes.
    fn arity(self) -> usize {
        match self {
            Self::Chat | Self::Death | Self::Emote | Self::Say => 3,
            Self::Staff => 2,
            Self::System => 1,
        }
    }

    fn render(self, f: &[String]) -> String {
        match self {
            Self::Chat | Self::Say => format!("[**{}**] {}: {}", f[0], f[1], f[2]),
            Self::Staff => format!("**{}**: {}", f[0], f[1]),
            Self::Death => format!("[**{}**] {} {}", f[0], f[1], f[2]),
            Self::Emote => format!("[**{}**] {}: {}", f[0], f[1], f[2]),
            Self::System => f[0].clone(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    #[error("{kind} needs {expected} fields, got {got}")]
    MissingFields {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub kind: MessageKind,
    pub fields: Vec<String>,
}

fn strip_line_end(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Kind tag of a raw line, without checking its fields.
pub fn kind_of(line: &str) -> Result<MessageKind, ProtocolError> {
    let line = strip_line_end(line);
    let tag = line.split(SEPARATOR).next().unwrap_or_default();
    MessageKind::from_tag(tag).ok_or_else(|| ProtocolError::UnknownKind(tag.to_string()))
}

impl RelayMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let kind = kind_of(line)?;
        let line = strip_line_end(line);
        let body = line
            .get(kind.tag().len() + SEPARATOR.len()..)
            .unwrap_or_default();

        // SYS 본문은 여러 줄의 markdown이라 통째로 한 필드
        let fields: Vec<String> = match kind {
            MessageKind::System if !body.is_empty() => vec![body.to_string()],
            MessageKind::System => Vec::new(),
            _ if body.is_empty() => Vec::new(),
            _ => body.split(SEPARATOR).map(String::from).collect(),
        };

        if fields.len() < kind.arity() {
            return Err(ProtocolError::MissingFields {
                kind: kind.tag(),
                expected: kind.arity(),
                got: fields.len(),
            });
        }
        Ok(Self { kind, fields })
    }

    /// Text posted to a bound channel. Extra fields are ignored.
    pub fn render(&self) -> String {
        self.kind.render(&self.fields)
    }
}

/// `KIND::f1::f2::...::\n`
pub fn encode(kind: MessageKind, fields: &[&str]) -> String {
    let mut line = String::from(kind.tag());
    for field in fields {
        line.push_str(SEPARATOR);
        line.push_str(field);
    }
    line.push_str(SEPARATOR);
    line.push('\n');
    line
}

/// Line carrying chat typed in an external channel.
pub fn channel_chat(author: &str, content: &str) -> String {
    encode(MessageKind::Chat, &["Discord", &escape(author), &escape(content)])
}

/// Internal notice; never leaves the relay towards clients.
pub fn system_notice(text: &str) -> String {
    format!("{}{}{}", MessageKind::System.tag(), SEPARATOR, text)
}

/// Client name from a handshake line, `None` if malformed.
pub fn parse_handshake(line: &str) -> Option<String> {
    let mut parts = strip_line_end(line).split(SEPARATOR);
    if parts.next()? != "HSHK" {
        return None;
    }
    let name = parts.next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Makes free text safe to embed as a single field.
pub fn escape(text: &str) -> String {
    // "::::" 처럼 겹친 구분자는 한 번으로 다 안 잡힌다
    text.trim()
        .replace('\n', "\\n")
        .replace(SEPARATOR, ":\\:")
        .replace(SEPARATOR, ":\\:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_line() {
        let msg = RelayMessage::parse("MSG::survival::Steve::hello there::\n").unwrap();
        assert_eq!(msg.kind, MessageKind::Chat);
        assert_eq!(msg.render(), "[**survival**] Steve: hello there");
    }

    #[test]
    fn test_templates_per_kind() {
        let cases = [
            ("STF::survival::Server restarting soon::\n", "**survival**: Server restarting soon"),
            ("DTH::survival::Alex::fell from a high place::\n", "[**survival**] Alex fell from a high place"),
            ("ME::survival::Steve::waves::\n", "[**survival**] Steve: waves"),
            ("SAY::survival::Server::hi::\n", "[**survival**] Server: hi"),
        ];
        for (line, expected) in cases {
            assert_eq!(RelayMessage::parse(line).unwrap().render(), expected, "{}", line);
        }
    }

    #[test]
    fn test_system_body_is_single_field() {
        let line = system_notice("```markdown\n# survival connected!\n```");
        let msg = RelayMessage::parse(&line).unwrap();
        assert_eq!(msg.kind, MessageKind::System);
        assert_eq!(msg.render(), "```markdown\n# survival connected!\n```");
    }

    #[test]
    fn test_unknown_kind_and_missing_fields() {
        assert_eq!(kind_of("XYZ::a::b\n"), Err(ProtocolError::UnknownKind("XYZ".into())));
        assert!(matches!(
            RelayMessage::parse("MSG::survival::\n"),
            Err(ProtocolError::MissingFields { kind: "MSG", .. })
        ));
        assert!(RelayMessage::parse("SYS::").is_err());
    }

    #[test]
    fn test_handshake() {
        assert_eq!(parse_handshake("HSHK::survival\n"), Some("survival".to_string()));
        assert_eq!(parse_handshake("HSHK::creative::\r\n"), Some("creative".to_string()));
        assert_eq!(parse_handshake("HSHK::\n"), None);
        assert_eq!(parse_handshake("HELLO::survival\n"), None);
        assert_eq!(parse_handshake(""), None);
    }

    #[test]
    fn test_escape_and_channel_chat() {
        assert_eq!(escape("  a\nb  "), "a\\nb");
        assert_eq!(escape("x::y"), "x:\\:y");
        assert!(!escape("a::::b").contains("::"));
        assert_eq!(channel_chat("Bob", "hi::there"), "MSG::Discord::Bob::hi:\\:there::\n");
    }

    #[test]
    fn test_encode_then_parse() {
        let line = encode(MessageKind::Death, &["skyblock", "Steve", "drowned"]);
        assert_eq!(line, "DTH::skyblock::Steve::drowned::\n");
        assert_eq!(RelayMessage::parse(&line).unwrap().fields.len(), 4);
    }
}
