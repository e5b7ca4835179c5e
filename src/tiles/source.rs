//! Tile URL templating
//!
//! Supported placeholders: `{z}`, `{x}`, `{y}`, `{s}` (subdomain picked by
//! `(x + y + z) mod n`), `{r}` (`@2x` on retina) and `{scale}` (`2` or `1`).
//! Templates are parsed once so bad placeholders fail at construction.

use super::key::TileKey;
use crate::core::constants::RETINA_SUFFIX;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Zoom,
    Column,
    Row,
    Subdomain,
    Retina,
    Scale,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "z" => Some(Self::Zoom),
            "x" => Some(Self::Column),
            "y" => Some(Self::Row),
            "s" => Some(Self::Subdomain),
            "r" => Some(Self::Retina),
            "scale" => Some(Self::Scale),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    template: String,
    segments: Vec<Segment>,
    subdomains: Vec<String>,
    supports_retina: bool,
}

impl UrlTemplate {
    pub fn new(template: &str, subdomains: Vec<String>, supports_retina: bool) -> Result<Self> {
        let segments = Self::parse(template)?;
        let uses_subdomain = segments
            .iter()
            .any(|s| *s == Segment::Placeholder(Placeholder::Subdomain));
        if uses_subdomain && subdomains.is_empty() {
            return Err(Error::InvalidTemplate(format!(
                "{template:?} uses {{s}} but no subdomains are configured"
            )));
        }

        Ok(Self {
            template: template.to_string(),
            segments,
            subdomains,
            supports_retina,
        })
    }

    fn parse(template: &str) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                Error::InvalidTemplate(format!("unclosed placeholder in {template:?}"))
            })?;
            let name = &after[..close];
            let placeholder = Placeholder::parse(name).ok_or_else(|| {
                Error::InvalidTemplate(format!("unknown placeholder {{{name}}} in {template:?}"))
            })?;
            segments.push(Segment::Placeholder(placeholder));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(segments)
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Retina factor to request at the given device pixel ratio
    pub fn retina_scale(&self, dpr: f64) -> u8 {
        if self.supports_retina && dpr > 1.0 {
            2
        } else {
            1
        }
    }

    pub fn subdomain(&self, key: &TileKey) -> &str {
        if self.subdomains.is_empty() {
            return "";
        }
        let index = (key.x as u64 + key.y as u64 + key.z as u64) % self.subdomains.len() as u64;
        &self.subdomains[index as usize]
    }

    /// Expand the template for `key`, returning the URL and its retina scale
    pub fn url(&self, key: &TileKey, dpr: f64) -> (String, u8) {
        let scale = self.retina_scale(dpr);
        let mut url = String::with_capacity(self.template.len() + 16);

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => url.push_str(text),
                Segment::Placeholder(Placeholder::Zoom) => url.push_str(&key.z.to_string()),
                Segment::Placeholder(Placeholder::Column) => url.push_str(&key.x.to_string()),
                Segment::Placeholder(Placeholder::Row) => url.push_str(&key.y.to_string()),
                Segment::Placeholder(Placeholder::Subdomain) => url.push_str(self.subdomain(key)),
                Segment::Placeholder(Placeholder::Retina) => {
                    if scale > 1 {
                        url.push_str(RETINA_SUFFIX);
                    }
                }
                Segment::Placeholder(Placeholder::Scale) => url.push_str(&scale.to_string()),
            }
        }

        (url, scale)
    }
}
