//! Topic templates
//!
//! A template is literal text with `{node}`, `{transfer}` and `{asset}`
//! placeholders, compiled once per transfer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use super::validate_topic_name;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Node,
    Transfer,
    Asset,
}

/// Error compiling a topic template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    Empty,
    UnknownPlaceholder(String),
    Unterminated,
    /// Literal text is not allowed in an MQTT topic name
    InvalidLiteral(&'static str),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "topic template is empty"),
            Self::UnknownPlaceholder(p) => write!(f, "unknown topic placeholder {{{}}}", p),
            Self::Unterminated => write!(f, "unterminated placeholder in topic template"),
            Self::InvalidLiteral(reason) => write!(f, "invalid topic template: {}", reason),
        }
    }
}

impl std::error::Error for TemplateError {}

/// Values substituted into a template
#[derive(Debug, Clone, Copy)]
pub struct TopicContext<'a> {
    pub node: &'a str,
    pub transfer: &'a str,
    /// Falls back to the transfer id when absent
    pub asset: Option<&'a str>,
}

/// A compiled topic template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        if template.is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or(TemplateError::Unterminated)?;
            segments.push(match &after[..close] {
                "node" => Segment::Node,
                "transfer" => Segment::Transfer,
                "asset" => Segment::Asset,
                other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
            });
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        for segment in &segments {
            if let Segment::Literal(text) = segment {
                if text.contains('}') {
                    return Err(TemplateError::Unterminated);
                }
                if text.contains('+') || text.contains('#') || text.contains('\0') {
                    return Err(TemplateError::InvalidLiteral(
                        "literal text contains wildcard or null characters",
                    ));
                }
            }
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the rendered topic differs per node
    pub fn depends_on_node(&self) -> bool {
        self.segments.contains(&Segment::Node)
    }

    /// Render and validate the destination topic
    pub fn render(&self, ctx: &TopicContext<'_>) -> Result<String, &'static str> {
        let mut topic = String::with_capacity(self.source.len() + ctx.node.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => topic.push_str(text),
                Segment::Node => topic.push_str(ctx.node),
                Segment::Transfer => topic.push_str(ctx.transfer),
                Segment::Asset => topic.push_str(ctx.asset.unwrap_or(ctx.transfer)),
            }
        }
        validate_topic_name(&topic)?;
        Ok(topic)
    }
}

impl FromStr for TopicTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for TopicTemplate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TopicTemplate::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx<'a>(node: &'a str) -> TopicContext<'a> {
        TopicContext {
            node,
            transfer: "tp-1",
            asset: None,
        }
    }

    #[test]
    fn substitutes_node_verbatim() {
        let template = TopicTemplate::parse("plant/{node}").unwrap();
        assert!(template.depends_on_node());
        assert_eq!(
            template.render(&ctx("ns=2;s=Temperature")).unwrap(),
            "plant/ns=2;s=Temperature"
        );
    }

    #[test]
    fn asset_falls_back_to_transfer() {
        let template = TopicTemplate::parse("{asset}/{transfer}").unwrap();
        assert!(!template.depends_on_node());
        assert_eq!(template.render(&ctx("n")).unwrap(), "tp-1/tp-1");

        let with_asset = TopicContext {
            asset: Some("asset-7"),
            ..ctx("n")
        };
        assert_eq!(template.render(&with_asset).unwrap(), "asset-7/tp-1");
    }

    #[test]
    fn rejects_bad_templates() {
        assert_eq!(TopicTemplate::parse(""), Err(TemplateError::Empty));
        assert_eq!(
            TopicTemplate::parse("plant/{nod}"),
            Err(TemplateError::UnknownPlaceholder("nod".to_string()))
        );
        assert_eq!(
            TopicTemplate::parse("plant/{node"),
            Err(TemplateError::Unterminated)
        );
        assert_eq!(
            TopicTemplate::parse("plant/node}"),
            Err(TemplateError::Unterminated)
        );
        assert!(matches!(
            TopicTemplate::parse("plant/#"),
            Err(TemplateError::InvalidLiteral(_))
        ));
    }

    #[test]
    fn rendered_wildcards_are_refused() {
        let template = TopicTemplate::parse("plant/{node}").unwrap();
        assert_eq!(
            template.render(&ctx("ns=1;s=a+b")),
            Err("topic name cannot contain wildcards")
        );
    }
}
