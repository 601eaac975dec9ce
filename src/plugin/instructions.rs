//! Agent-instructions documents (`CLAUDE.md`, `AGENTS.md`, ...).
//!
//! A document is a sequence of plain text blocks and plugin-owned regions.
//! Each region sits between a start and an end marker line:
//!
//! ```text
//! <!-- dex:reviewer -->
//! Review every diff twice.
//! <!-- /dex:reviewer -->
//! ```
//!
//! A start marker without a matching end marker is kept as plain text, so a
//! hand-edited file never loses content on the next write.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Region { name: String, body: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionsDocument {
    segments: Vec<Segment>,
}

pub fn start_marker(name: &str) -> String {
    format!("<!-- dex:{name} -->")
}

pub fn end_marker(name: &str) -> String {
    format!("<!-- /dex:{name} -->")
}

fn start_marker_name(line: &str) -> Option<&str> {
    let name = line.strip_prefix("<!-- dex:")?.strip_suffix(" -->")?;
    let valid = !name.is_empty() && !name.contains(char::is_whitespace);
    valid.then_some(name)
}

/// Drops blank lines around a block without touching indentation inside it.
fn trim_block(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let first = lines.iter().position(|line| !line.trim().is_empty());
    let last = lines.iter().rposition(|line| !line.trim().is_empty());
    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last]
            .iter()
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

impl InstructionsDocument {
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let mut segments = Vec::new();
        let mut pending: Vec<&str> = Vec::new();
        let mut index = 0;

        while index < lines.len() {
            // A second start marker for the same name before any end marker
            // leaves this one unterminated.
            let region = start_marker_name(lines[index].trim()).and_then(|name| {
                let start = start_marker(name);
                let end = end_marker(name);
                (index + 1..lines.len())
                    .find(|&candidate| {
                        let line = lines[candidate].trim();
                        line == end || line == start
                    })
                    .filter(|&candidate| lines[candidate].trim() == end)
                    .map(|end_index| (name, end_index))
            });

            match region {
                Some((name, end_index)) => {
                    push_text(&mut segments, &pending.join("\n"));
                    pending.clear();
                    segments.push(Segment::Region {
                        name: name.to_string(),
                        body: trim_block(&lines[index + 1..end_index].join("\n")),
                    });
                    index = end_index + 1;
                }
                None => {
                    pending.push(lines[index]);
                    index += 1;
                }
            }
        }
        push_text(&mut segments, &pending.join("\n"));

        Self { segments }
    }

    pub fn render(&self) -> String {
        let blocks: Vec<String> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Text(text) => text.clone(),
                Segment::Region { name, body } if body.is_empty() => {
                    format!("{}\n{}", start_marker(name), end_marker(name))
                }
                Segment::Region { name, body } => {
                    format!("{}\n{body}\n{}", start_marker(name), end_marker(name))
                }
            })
            .collect();

        if blocks.is_empty() {
            return String::new();
        }
        format!("{}\n", blocks.join("\n\n"))
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Unmarked text, in document order.
    pub fn project_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text(text) => Some(text.as_str()),
                Segment::Region { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn region(&self, name: &str) -> Option<&str> {
        self.segments.iter().find_map(|segment| match segment {
            Segment::Region { name: owner, body } if owner == name => Some(body.as_str()),
            _ => None,
        })
    }

    pub fn region_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Region { name, .. } => Some(name.as_str()),
                Segment::Text(_) => None,
            })
            .collect()
    }

    /// Replaces the plugin's region in place, or appends a new one at the end.
    pub fn set_region(&mut self, name: &str, content: &str) {
        let body = trim_block(content);
        let existing = self.segments.iter_mut().find_map(|segment| match segment {
            Segment::Region { name: owner, body } if owner == name => Some(body),
            _ => None,
        });

        match existing {
            Some(current) => *current = body,
            None => self.segments.push(Segment::Region {
                name: name.to_string(),
                body,
            }),
        }
    }

    /// Rebuilds the document as the new project text followed by every
    /// existing region in its current order.
    pub fn set_project(&mut self, text: &str) {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        push_text(&mut segments, text);
        segments.extend(
            self.segments
                .drain(..)
                .filter(|segment| matches!(segment, Segment::Region { .. })),
        );
        self.segments = segments;
    }

    /// Returns whether a region was removed.
    pub fn remove_region(&mut self, name: &str) -> bool {
        let before = self.segments.len();
        self.segments.retain(|segment| {
            !matches!(segment, Segment::Region { name: owner, .. } if owner == name)
        });
        before != self.segments.len()
    }
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    let block = trim_block(text);
    if !block.is_empty() {
        segments.push(Segment::Text(block));
    }
}
