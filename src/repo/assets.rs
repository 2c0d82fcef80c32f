// src/repo/assets.rs

//! Operator-provided repository metadata
//!
//! `assets/<name>/` may hold `distribution.xml`, `components.xml` and
//! `groups.xml`. The children of each root element are copied into the index
//! untouched; the distribution file also carries the obsoletion rules:
//!
//! ```xml
//! <PISI>
//!     <Obsoletes>
//!         <Package>old-name</Package>
//!     </Obsoletes>
//! </PISI>
//! ```

use crate::error::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

pub const DISTRIBUTION_FILE: &str = "distribution.xml";
pub const COMPONENTS_FILE: &str = "components.xml";
pub const GROUPS_FILE: &str = "groups.xml";

/// The assets of one repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assets {
    /// Inner content of `distribution.xml`
    pub distribution: Option<String>,
    /// Inner content of `components.xml`
    pub components: Option<String>,
    /// Inner content of `groups.xml`
    pub groups: Option<String>,
    /// Package names excluded from the index
    pub obsoletes: BTreeSet<String>,
}

impl Assets {
    /// Load whatever asset files exist in `dir`
    pub fn load(dir: &Path) -> Result<Self> {
        let distribution = read_optional(&dir.join(DISTRIBUTION_FILE))?;
        let components = read_optional(&dir.join(COMPONENTS_FILE))?;
        let groups = read_optional(&dir.join(GROUPS_FILE))?;

        let obsoletes = match &distribution {
            Some(content) => parse_obsoletes(content)?,
            None => BTreeSet::new(),
        };

        Ok(Self {
            distribution: distribution.as_deref().map(inner_content).transpose()?,
            components: components.as_deref().map(inner_content).transpose()?,
            groups: groups.as_deref().map(inner_content).transpose()?,
            obsoletes,
        })
    }

    pub fn is_obsolete(&self, name: &str) -> bool {
        self.obsoletes.contains(name)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            debug!("Loaded asset {}", path.display());
            Ok(Some(content))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Everything between the root element's start and end tags
pub fn inner_content(document: &str) -> Result<String> {
    let mut reader = Reader::from_str(document);
    let mut root: Option<(String, usize)> = None;
    let mut depth = 0usize;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if depth == 0 {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    root = Some((name, reader.buffer_position()));
                }
                depth += 1;
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Empty(_) if depth == 0 => return Ok(String::new()),
            Event::Eof => break,
            _ => {}
        }
    }

    let (name, start) = root.ok_or_else(|| Error::ParseError("asset has no root element".into()))?;
    let end = document
        .rfind(&format!("</{}", name))
        .filter(|end| *end >= start)
        .ok_or_else(|| Error::ParseError(format!("unterminated <{}>", name)))?;
    Ok(document[start..end].trim().to_string())
}

/// Names listed as `<Obsoletes><Package>` entries
pub fn parse_obsoletes(document: &str) -> Result<BTreeSet<String>> {
    let mut reader = Reader::from_str(document);
    reader.trim_text(true);

    let mut obsoletes = BTreeSet::new();
    let mut in_obsoletes = false;
    let mut in_package = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"Obsoletes" => in_obsoletes = true,
                b"Package" if in_obsoletes => in_package = true,
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"Obsoletes" => in_obsoletes = false,
                b"Package" => in_package = false,
                _ => {}
            },
            Event::Text(t) if in_package => {
                let name = t.unescape()?;
                if !name.is_empty() {
                    obsoletes.insert(name.into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(obsoletes)
}
